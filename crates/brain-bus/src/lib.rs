//! In-process message channels for the brain overlay
//!
//! This crate provides:
//! - Named many-to-many broadcast channels
//! - Per-subscriber FIFO delivery through unbounded mailboxes
//! - Releasable subscription handles and closable publishers

pub mod bus;
pub mod publisher;

pub use bus::{BusError, Envelope, MessageBus, Sink, Subscription};
pub use publisher::Publisher;
