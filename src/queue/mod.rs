pub mod manager;
pub mod queue;

pub use manager::{OutboundMessage, OutboundPayload, QueueEvents, QueueManager};
pub use queue::{Envelope, Queue, QueueConfig, QueueKey, QueueKind, QueuedMessage};
