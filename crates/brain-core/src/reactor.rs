//! Payload reactors
//!
//! A reactor turns one inbound payload into zero or one outbound payloads.
//! Each node owns its reactor outright, so any state a variant carries is
//! private to that node.

use crate::types::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transformation applied to every payload a node receives on an input channel
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Reactor {
    /// Forward every payload unchanged
    #[default]
    Identity,
    /// One-step delay line: emits the previous payload, holds the current one
    Delay { previous: Option<Payload> },
    /// Absorb everything, emit nothing
    Sink,
}

impl Reactor {
    pub fn identity() -> Self {
        Self::Identity
    }

    pub fn delay() -> Self {
        Self::Delay { previous: None }
    }

    pub fn sink() -> Self {
        Self::Sink
    }

    /// Fresh reactor of the given kind
    pub fn from_kind(kind: ReactorKind) -> Self {
        match kind {
            ReactorKind::Identity => Self::identity(),
            ReactorKind::Delay => Self::delay(),
            ReactorKind::Sink => Self::sink(),
        }
    }

    pub fn kind(&self) -> ReactorKind {
        match self {
            Self::Identity => ReactorKind::Identity,
            Self::Delay { .. } => ReactorKind::Delay,
            Self::Sink => ReactorKind::Sink,
        }
    }

    /// Apply the transformation to one payload
    pub fn apply(&mut self, payload: Payload) -> Option<Payload> {
        match self {
            Self::Identity => Some(payload),
            Self::Delay { previous } => previous.replace(payload),
            Self::Sink => None,
        }
    }
}

/// Stateless selector for a reactor variant (configuration surface)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactorKind {
    #[default]
    Identity,
    Delay,
    Sink,
}

impl fmt::Display for ReactorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Identity => "identity",
            Self::Delay => "delay",
            Self::Sink => "sink",
        })
    }
}

impl FromStr for ReactorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::Identity),
            "delay" => Ok(Self::Delay),
            "sink" => Ok(Self::Sink),
            other => Err(format!("unknown reactor: {other}")),
        }
    }
}
