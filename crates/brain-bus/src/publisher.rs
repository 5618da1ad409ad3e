//! Channel publishers

use crate::bus::{BusError, BusInner};
use brain_core::types::{ChannelId, Payload};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Write handle bound to a single channel
pub struct Publisher {
    channel: ChannelId,
    bus: Arc<BusInner>,
    /// Is the publisher open
    open: RwLock<bool>,
}

impl Publisher {
    pub(crate) fn new(channel: ChannelId, bus: Arc<BusInner>) -> Self {
        Self {
            channel,
            bus,
            open: RwLock::new(true),
        }
    }

    /// Channel this publisher writes to
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Check if the publisher is open
    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    /// Publish a body on the bound channel
    pub fn write(&self, body: Payload) -> Result<usize, BusError> {
        if !self.is_open() {
            return Err(BusError::PublisherClosed(self.channel.clone()));
        }
        Ok(self.bus.publish(&self.channel, &body))
    }

    /// Close the publisher. Closing twice fails.
    pub async fn close(&self) -> Result<(), BusError> {
        let mut open = self.open.write();
        if !*open {
            return Err(BusError::PublisherClosed(self.channel.clone()));
        }
        *open = false;
        trace!("Publisher for {} closed", self.channel.short());
        Ok(())
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("channel", &self.channel)
            .field("open", &self.is_open())
            .finish()
    }
}
