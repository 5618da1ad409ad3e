//! Core wire types for the brain overlay
//!
//! Every message travelling over the bus is a JSON object. Field names
//! (`command`, `address`) are the durable contract between nodes and
//! drivers; payloads are opaque objects handed to a node's reactor.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Application payload relayed between nodes.
pub type Payload = Value;

// =============================================================================
// CHANNELS
// =============================================================================

/// Name of the process-wide control channel.
pub const CONTROL_CHANNEL: &str = "control";

/// Name of the process-wide advertisement channel.
pub const ADVERTISEMENT_CHANNEL: &str = "advertisement";

/// Field carrying a control command tag
pub const COMMAND_FIELD: &str = "command";

/// Field carrying a channel address
pub const ADDRESS_FIELD: &str = "address";

/// Identifier of a named bus channel
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap an existing channel name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fresh per-node channel (UUID v4, never one of the well-known names)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The shared control channel
    pub fn control() -> Self {
        Self::new(CONTROL_CHANNEL)
    }

    /// The shared advertisement channel
    pub fn advertisement() -> Self {
        Self::new(ADVERTISEMENT_CHANNEL)
    }

    /// Whether this is one of the reserved process-wide channels
    pub fn is_well_known(&self) -> bool {
        self.0 == CONTROL_CHANNEL || self.0 == ADVERTISEMENT_CHANNEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ChannelId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Gossip announcement of a node's output channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub address: ChannelId,
}

impl Advertisement {
    pub fn new(address: ChannelId) -> Self {
        Self { address }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(ADDRESS_FIELD.into(), Value::String(self.address.to_string()));
        Value::Object(map)
    }

    pub fn from_json(body: &Value) -> Result<Self> {
        let map = body.as_object().ok_or(Error::NotAnObject)?;
        let address = string_field(map, ADDRESS_FIELD)?;
        Ok(Self::new(ChannelId::new(address)))
    }
}

/// Command published on the control channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Periodic heartbeat; may trigger an advertisement
    Tick,
    /// Terminal shutdown addressed to a node's output channel
    Close { address: ChannelId },
}

impl ControlMessage {
    pub const TICK: &'static str = "tick";
    pub const CLOSE: &'static str = "close";

    pub fn close(address: ChannelId) -> Self {
        Self::Close { address }
    }

    /// Command tag as it appears on the wire
    pub fn command(&self) -> &'static str {
        match self {
            Self::Tick => Self::TICK,
            Self::Close { .. } => Self::CLOSE,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(COMMAND_FIELD.into(), Value::String(self.command().into()));
        if let Self::Close { address } = self {
            map.insert(ADDRESS_FIELD.into(), Value::String(address.to_string()));
        }
        Value::Object(map)
    }

    /// Decode a control body. Unknown tags surface as [`Error::InvalidCommand`].
    pub fn from_json(body: &Value) -> Result<Self> {
        let map = body.as_object().ok_or(Error::NotAnObject)?;
        let command = string_field(map, COMMAND_FIELD)?;
        match command {
            Self::TICK => Ok(Self::Tick),
            Self::CLOSE => {
                let address = string_field(map, ADDRESS_FIELD)?;
                Ok(Self::close(ChannelId::new(address)))
            }
            other => Err(Error::InvalidCommand(other.to_string())),
        }
    }
}

fn string_field<'a>(map: &'a Map<String, Value>, field: &'static str) -> Result<&'a str> {
    match map.get(field) {
        None | Some(Value::Null) => Err(Error::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(Error::WrongType {
            field,
            expected: "string",
        }),
    }
}
