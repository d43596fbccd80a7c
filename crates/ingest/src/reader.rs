//! Fault-tolerant block reads from an inbound byte stream.

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Result of one [`ChunkedStreamReader::read`] call.
#[derive(Debug)]
pub struct ReadOutcome {
    /// Bytes pulled from the stream, never padded.
    pub data: Bytes,
    /// The read stopped early because of a fault or cancellation.
    pub aborted: bool,
    /// The fault, when it was not a disconnect-style or cancellation abort.
    pub abort_error: Option<io::Error>,
}

impl ReadOutcome {
    /// Number of bytes pulled from the stream.
    pub fn bytes_read(&self) -> usize {
        self.data.len()
    }

    fn complete(data: Bytes) -> Self {
        Self {
            data,
            aborted: false,
            abort_error: None,
        }
    }
}

/// Whether a stream fault means the client went away rather than something broke.
pub fn is_recoverable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Reads fixed-size blocks from an inbound stream.
///
/// Each read accumulates up to `limit` bytes, stopping early at end of
/// stream, on a fault, or on cancellation. The returned length is the
/// running count of bytes actually received.
pub struct ChunkedStreamReader<R> {
    inner: R,
}

impl<R> ChunkedStreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read up to `limit` bytes.
    ///
    /// An empty, non-aborted outcome means the stream is exhausted.
    pub async fn read(&mut self, limit: usize, cancel: &CancellationToken) -> ReadOutcome {
        if limit == 0 {
            return ReadOutcome::complete(Bytes::new());
        }

        let mut buf = vec![0u8; limit];
        let mut filled = 0;

        while filled < limit {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(bytes_read = filled, "Read cancelled");
                    buf.truncate(filled);
                    return ReadOutcome {
                        data: Bytes::from(buf),
                        aborted: true,
                        abort_error: None,
                    };
                }
                result = self.inner.read(&mut buf[filled..]) => result,
            };

            match result {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    buf.truncate(filled);
                    let abort_error = if is_recoverable(&e) {
                        tracing::debug!(bytes_read = filled, error = %e, "Inbound stream disconnected");
                        None
                    } else {
                        tracing::warn!(bytes_read = filled, error = %e, "Inbound stream failed");
                        Some(e)
                    };
                    return ReadOutcome {
                        data: Bytes::from(buf),
                        aborted: true,
                        abort_error,
                    };
                }
            }
        }

        buf.truncate(filled);
        ReadOutcome::complete(Bytes::from(buf))
    }
}
