pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{body, harness, seeded_bytes, Harness};
#[allow(unused_imports)]
pub use mocks::{Failure, InstrumentedStore};
