//! Brain Core Library
//!
//! This crate provides the wire types and the pluggable payload
//! transformations shared by every participant of the brain overlay.
//!
//! # Modules
//!
//! - [`types`]: Channel identifiers and control/advertisement messages
//! - [`reactor`]: Payload transformations applied by relaying nodes
//! - [`error`]: Error types

pub mod error;
pub mod reactor;
pub mod types;

#[cfg(test)]
mod wire_vectors;

pub use error::{Error, Result};
pub use reactor::{Reactor, ReactorKind};
pub use types::*;
