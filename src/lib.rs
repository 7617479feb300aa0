// Core types are re-exported from the platform-neutral crate
pub use callcore::{analysis, quality};

pub mod types {
    pub use callcore::types::*;
}

pub mod calls;
pub mod config;
pub mod media;
pub mod store;

pub use calls::{CallError, CallManager, CallSession, LocalState, StartCall};
pub use config::CallConfig;
