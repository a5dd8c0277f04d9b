//! The worker-thread side of the broker: readiness selection, the per-socket
//! transport state machine, thread channels and the worker loop itself.

pub mod channel;
pub mod mailbox;
pub mod selector;
pub mod transport;
pub mod worker;
