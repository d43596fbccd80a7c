//! Upload identifiers, remote attributes and lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of an upload session.
///
/// Rendered as 32 lowercase hex digits without dashes, which keeps it safe
/// to use verbatim as a remote object key and as a local directory name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from either the simple or the hyphenated form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidUploadId(format!("{s:?}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0.simple())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for UploadId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// Upload lifecycle state.
///
/// Transitions happen only through committed remote appends and never
/// leave `Complete`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Created, nothing committed yet.
    Created,
    /// Some bytes committed, more expected.
    Receiving,
    /// Every declared byte is committed.
    Complete,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Receiving => write!(f, "receiving"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Attributes of an upload as stored on the remote object.
///
/// `offset` is the remote object's current length and is authoritative;
/// callers should fetch a fresh copy instead of caching one across calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAttributes {
    /// Declared total length, fixed at creation.
    pub upload_length: u64,
    /// Opaque metadata string, fixed at creation.
    pub metadata: String,
    /// Bytes durably committed to the remote object.
    pub offset: u64,
}

impl UploadAttributes {
    /// Attributes of a freshly created, empty upload.
    pub fn new(upload_length: u64, metadata: impl Into<String>) -> Self {
        Self {
            upload_length,
            metadata: metadata.into(),
            offset: 0,
        }
    }

    /// Bytes still expected before the upload is complete.
    pub fn remaining(&self) -> u64 {
        self.upload_length.saturating_sub(self.offset)
    }

    /// Check whether every declared byte has been committed.
    pub fn is_complete(&self) -> bool {
        self.offset >= self.upload_length
    }

    /// Derive the lifecycle state from the committed offset.
    pub fn state(&self) -> UploadState {
        if self.is_complete() {
            UploadState::Complete
        } else if self.offset == 0 {
            UploadState::Created
        } else {
            UploadState::Receiving
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_roundtrip() {
        let id = UploadId::new();
        let as_str = id.to_string();
        assert_eq!(as_str.len(), 32);
        assert!(!as_str.contains('-'));

        let parsed = UploadId::parse(&as_str).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.as_uuid(), parsed.as_uuid());
    }

    #[test]
    fn test_upload_id_accepts_hyphenated_form() {
        let id = UploadId::new();
        let hyphenated = id.as_uuid().hyphenated().to_string();
        assert_eq!(UploadId::parse(&hyphenated).unwrap(), id);
    }

    #[test]
    fn test_upload_id_rejects_garbage() {
        assert!(UploadId::parse("not-a-uuid").is_err());
        assert!(UploadId::parse("../../etc/passwd").is_err());
        assert!(UploadId::parse("").is_err());
    }

    #[test]
    fn test_state_transitions_follow_offset() {
        let mut attrs = UploadAttributes::new(100, "meta-x");
        assert_eq!(attrs.state(), UploadState::Created);
        assert_eq!(attrs.remaining(), 100);

        attrs.offset = 40;
        assert_eq!(attrs.state(), UploadState::Receiving);
        assert_eq!(attrs.remaining(), 60);

        attrs.offset = 100;
        assert_eq!(attrs.state(), UploadState::Complete);
        assert_eq!(attrs.remaining(), 0);
    }

    #[test]
    fn test_zero_length_upload_is_complete_at_creation() {
        let attrs = UploadAttributes::new(0, "");
        assert!(attrs.is_complete());
        assert_eq!(attrs.state(), UploadState::Complete);
    }
}
