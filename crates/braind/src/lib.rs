//! braind - Self-organizing gossip relay overlay
//!
//! This crate provides:
//! - Relay nodes that discover peers through probabilistic advertisements
//! - Per-node serialized state machines driven over the message bus
//! - A control driver emitting ticks and close commands
//! - An overlay host for running and inspecting a population of nodes

pub mod config;
pub mod driver;
pub mod node;
pub mod overlay;

pub use config::{ClosePolicy, Config, NodeConfig};
pub use driver::ControlDriver;
pub use node::{Node, NodeError, NodeStats};
pub use overlay::Overlay;
