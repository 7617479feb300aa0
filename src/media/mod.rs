//! Media transport implementations.
//!
//! Only the in-process fake lives here; platform transports implement
//! [`callcore::media::MediaTransport`] in their own crates.

pub mod fake;

pub use fake::{FakeMediaFactory, FakeMediaTransport, LoopbackHub};
