#![forbid(unsafe_code)]

//! Relay engine core: per-user message memory, event classification and the
//! rate-limited outbound queue.

pub mod classifier;
pub mod memory;
pub mod queue;

pub use classifier::{ClassifierConfig, EventClassifier, RelayIntent};
pub use memory::UserMemory;
pub use queue::{QueueConfig, RelayQueue};

/// The outbound queue's view of the connection supervisor: consulted before
/// every send, poked when a send attempt fails.
pub trait ConnectionGate: Send + Sync {
	/// True iff the supervisor currently reports a usable connection.
	fn is_sendable(&self) -> bool;

	/// Ask for a reconnect. Must be idempotent under concurrent callers.
	fn request_reconnect(&self);
}
