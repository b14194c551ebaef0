//! # Queue primitives
//!
//! Bounded, ordered conduits of items between a unit and its adjacent
//! edges — the flow-control mechanism of the whole engine. No separate
//! credit or token protocol exists: backpressure is exactly "the bounded
//! queue is full".
//!
//! - [`Inbox`] — the per-call batch of pending input items
//! - [`Outbox`] — the bounded, per-lane emission sink
//! - [`conduit`] — the bounded MPSC queue backing one (edge, consumer
//!   instance) pair

pub mod conduit;
pub mod inbox;
pub mod outbox;

pub use conduit::{conduit, ConduitReceiver, ConduitSender, TryPushError};
pub use inbox::Inbox;
pub use outbox::Outbox;
