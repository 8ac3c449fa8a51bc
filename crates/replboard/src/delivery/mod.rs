//! Delivery guarantees layered over peers and boards.
//!
//! - [`AtLeastOnceProxy`] retries calls with a per-attempt timeout
//! - [`AtMostOnceFilter`] answers repeated (sender, sequence) writes from a cache
//! - [`FaultTolerantProxy`] hands failed writes to a background retry queue

pub mod at_least_once;
pub mod at_most_once;
pub mod fault_tolerant;

pub use at_least_once::AtLeastOnceProxy;
pub use at_most_once::{AtMostOnceFilter, DEDUP_WINDOW};
pub use fault_tolerant::FaultTolerantProxy;
