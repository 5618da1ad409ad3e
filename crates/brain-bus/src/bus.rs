//! Named broadcast channels
//!
//! Every subscriber registers an unbounded mpsc sink. Publishing clones the
//! body into each sink of the channel without blocking, so each subscriber
//! observes a channel's messages in publish order. Nothing is promised about
//! ordering across channels.

use crate::publisher::Publisher;
use brain_core::types::{ChannelId, Payload};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Bus errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Not subscribed to channel {0}")]
    NotSubscribed(ChannelId),
    #[error("Publisher for channel {0} is closed")]
    PublisherClosed(ChannelId),
}

/// A message as delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Channel the message was published on
    pub channel: ChannelId,
    /// Message body
    pub body: Payload,
}

/// Delivery endpoint for a subscription
pub type Sink = mpsc::UnboundedSender<Envelope>;

type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    sink: Sink,
}

#[derive(Default)]
pub(crate) struct BusInner {
    /// Subscribers per channel
    channels: RwLock<HashMap<ChannelId, Vec<Subscriber>>>,
    /// Subscriber id allocator
    next_id: AtomicU64,
}

impl BusInner {
    pub(crate) fn publish(&self, channel: &ChannelId, body: &Payload) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let channels = self.channels.read();
            let Some(subscribers) = channels.get(channel) else {
                trace!("No subscribers on {}", channel.short());
                return 0;
            };
            for sub in subscribers {
                let envelope = Envelope {
                    channel: channel.clone(),
                    body: body.clone(),
                };
                if sub.sink.send(envelope).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(sub.id);
                }
            }
        }

        if !dead.is_empty() {
            debug!(
                "Pruning {} dead subscribers on {}",
                dead.len(),
                channel.short()
            );
            let mut channels = self.channels.write();
            if let Some(subscribers) = channels.get_mut(channel) {
                subscribers.retain(|s| !dead.contains(&s.id));
                if subscribers.is_empty() {
                    channels.remove(channel);
                }
            }
        }

        delivered
    }

    fn unsubscribe(&self, channel: &ChannelId, id: SubscriberId) -> Result<(), BusError> {
        let mut channels = self.channels.write();
        let subscribers = channels
            .get_mut(channel)
            .ok_or_else(|| BusError::NotSubscribed(channel.clone()))?;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        if subscribers.len() == before {
            return Err(BusError::NotSubscribed(channel.clone()));
        }
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        Ok(())
    }
}

/// In-process publish/subscribe bus. Clones share the same channels.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a body to every current subscriber of `channel`.
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, channel: &ChannelId, body: Payload) -> usize {
        self.inner.publish(channel, &body)
    }

    /// Register `sink` as a subscriber of `channel`
    pub fn subscribe(&self, channel: ChannelId, sink: Sink) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channels
            .write()
            .entry(channel.clone())
            .or_default()
            .push(Subscriber { id, sink });
        trace!("Subscriber {} joined {}", id, channel.short());
        Subscription {
            channel,
            id,
            bus: self.inner.clone(),
        }
    }

    /// Subscribe with a dedicated receiver
    pub fn subscribe_stream(
        &self,
        channel: ChannelId,
    ) -> (Subscription, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(channel, tx), rx)
    }

    /// Open a publisher bound to `channel`
    pub fn publisher(&self, channel: ChannelId) -> Publisher {
        Publisher::new(channel, self.inner.clone())
    }

    /// Drop every subscriber of `channel`. Their handles fail on release.
    pub fn remove_channel(&self, channel: &ChannelId) -> usize {
        let removed = self
            .inner
            .channels
            .write()
            .remove(channel)
            .map(|subs| subs.len())
            .unwrap_or(0);
        if removed > 0 {
            debug!("Removed {} subscribers from {}", removed, channel.short());
        }
        removed
    }

    /// Number of subscribers currently registered on `channel`
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.inner
            .channels
            .read()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Number of channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().len()
    }
}

/// Handle to one registration on the bus
pub struct Subscription {
    channel: ChannelId,
    id: SubscriberId,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Channel this subscription listens to
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Unregister from the bus
    pub async fn release(self) -> Result<(), BusError> {
        self.bus.unsubscribe(&self.channel, self.id)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}
