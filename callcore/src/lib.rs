//! Platform-neutral pieces of the call core: the shared record model, its
//! status ordering, and the seams the runtime talks to (signaling store,
//! media transport, frame analyzer).

pub mod analysis;
pub mod media;
pub mod quality;
pub mod store;
pub mod types;
