//! Relay nodes
//!
//! A node owns one output channel and a growing set of input channels. It
//! listens on the shared control and advertisement channels, advertises its
//! output address on ticks with a configurable probability, wires itself to
//! the first peer it hears about, and relays every input payload through its
//! reactor onto its output channel.
//!
//! All state lives in a single tokio task. Bus deliveries and operator
//! requests both arrive through that task's mailboxes, so transitions never
//! interleave. The [`Node`] handle only reads a snapshot the task publishes
//! after every transition.

use crate::config::{ClosePolicy, NodeConfig};
use brain_bus::{BusError, Envelope, MessageBus, Publisher, Sink, Subscription};
use brain_core::reactor::Reactor;
use brain_core::types::{
    Advertisement, ChannelId, ControlMessage, Payload, ADVERTISEMENT_CHANNEL, CONTROL_CHANNEL,
};
use futures::future::join_all;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Advertising chance {0} is outside [0, 1]")]
    InvalidChance(f64),
    #[error("Wire error: {0}")]
    Wire(#[from] brain_core::Error),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Teardown failed for {} resource(s)", .failures.len())]
    Teardown { failures: Vec<BusError> },
    #[error("Node closed")]
    Closed,
}

impl NodeError {
    /// Whether this error is an unrecognized control command
    pub fn is_invalid_command(&self) -> bool {
        matches!(self, Self::Wire(brain_core::Error::InvalidCommand(_)))
    }
}

/// Per-node counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Ticks received
    pub ticks: u64,
    /// Advertisements this node published
    pub advertisements_sent: u64,
    /// Advertisements observed (own included)
    pub advertisements_seen: u64,
    /// Input channels acquired from advertisements
    pub peers_learned: u64,
    /// Payloads published after the reactor yielded a value
    pub payloads_relayed: u64,
    /// Payloads the reactor swallowed
    pub payloads_absorbed: u64,
    /// Messages rejected as malformed or unknown
    pub invalid_messages: u64,
    /// Control messages with an unrecognized command (counted in `invalid_messages` too)
    pub invalid_commands: u64,
    /// Messages dropped because the node had already closed
    pub ignored_after_close: u64,
}

impl NodeStats {
    /// Add another node's counters into these
    pub fn accumulate(&mut self, other: &NodeStats) {
        self.ticks += other.ticks;
        self.advertisements_sent += other.advertisements_sent;
        self.advertisements_seen += other.advertisements_seen;
        self.peers_learned += other.peers_learned;
        self.payloads_relayed += other.payloads_relayed;
        self.payloads_absorbed += other.payloads_absorbed;
        self.invalid_messages += other.invalid_messages;
        self.invalid_commands += other.invalid_commands;
        self.ignored_after_close += other.ignored_after_close;
    }
}

/// Snapshot of node state, refreshed after every transition
#[derive(Debug, Clone)]
struct NodeView {
    wants_peer: bool,
    advertising_chance: f64,
    inputs: BTreeSet<ChannelId>,
    stats: NodeStats,
}

/// Operator requests, serialized with bus deliveries
enum Request {
    SetAdvertisingChance {
        chance: f64,
        reply: oneshot::Sender<()>,
    },
    ResetWantsPeer {
        reply: oneshot::Sender<()>,
    },
    Close {
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
}

/// Handle to a running node
#[derive(Clone)]
pub struct Node {
    address: ChannelId,
    requests: mpsc::UnboundedSender<Request>,
    view: Arc<RwLock<NodeView>>,
    closed: watch::Receiver<bool>,
}

impl Node {
    /// Spawn a node with default settings on the current tokio runtime
    pub fn new(bus: &MessageBus, reactor: Reactor) -> Self {
        Self::launch(bus, reactor, NodeConfig::default())
    }

    /// Spawn a node on the current tokio runtime
    pub fn spawn(bus: &MessageBus, reactor: Reactor, config: NodeConfig) -> Result<Self, NodeError> {
        validate_chance(config.advertising_chance)?;
        Ok(Self::launch(bus, reactor, config))
    }

    fn launch(bus: &MessageBus, reactor: Reactor, config: NodeConfig) -> Self {
        let address = ChannelId::generate();
        let publisher = bus.publisher(address.clone());

        let (sink, deliveries) = mpsc::unbounded_channel();
        let control = bus.subscribe(ChannelId::control(), sink.clone());
        let advertisement = bus.subscribe(ChannelId::advertisement(), sink.clone());

        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);

        let view = Arc::new(RwLock::new(NodeView {
            wants_peer: true,
            advertising_chance: config.advertising_chance,
            inputs: BTreeSet::new(),
            stats: NodeStats::default(),
        }));

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let actor = NodeActor {
            address: address.clone(),
            bus: bus.clone(),
            reactor,
            publisher,
            sink,
            control: Some(control),
            advertisement: Some(advertisement),
            inputs: HashMap::new(),
            wants_peer: true,
            advertising_chance: config.advertising_chance,
            close_policy: config.close_policy,
            closed: false,
            rng,
            stats: NodeStats::default(),
            view: view.clone(),
            closed_tx,
        };

        debug!(
            "Node {} created ({:?} reactor, chance {})",
            address.short(),
            actor.reactor.kind(),
            config.advertising_chance
        );
        tokio::spawn(actor.run(deliveries, requests));

        Self {
            address,
            requests: requests_tx,
            view,
            closed,
        }
    }

    /// Output channel of this node
    pub fn address(&self) -> &ChannelId {
        &self.address
    }

    /// Whether the node has reached its terminal state
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Whether the node will wire itself to the next advertised peer
    pub fn wants_peer(&self) -> bool {
        self.view.read().wants_peer
    }

    pub fn advertising_chance(&self) -> f64 {
        self.view.read().advertising_chance
    }

    /// Whether `channel` is one of this node's input channels
    pub fn is_listening(&self, channel: &ChannelId) -> bool {
        self.view.read().inputs.contains(channel)
    }

    /// Input channels learned so far, in sorted order
    pub fn input_addresses(&self) -> Vec<ChannelId> {
        self.view.read().inputs.iter().cloned().collect()
    }

    pub fn stats(&self) -> NodeStats {
        self.view.read().stats.clone()
    }

    /// Change the advertising probability
    pub async fn set_advertising_chance(&self, chance: f64) -> Result<(), NodeError> {
        validate_chance(chance)?;
        let (reply, done) = oneshot::channel();
        self.request(Request::SetAdvertisingChance { chance, reply })?;
        done.await.map_err(|_| NodeError::Closed)
    }

    /// Opt the node back into peer discovery
    pub async fn reset_wants_peer(&self) -> Result<(), NodeError> {
        let (reply, done) = oneshot::channel();
        self.request(Request::ResetWantsPeer { reply })?;
        done.await.map_err(|_| NodeError::Closed)
    }

    /// Tear the node down. Closing an already closed node is a no-op.
    pub async fn close(&self) -> Result<(), NodeError> {
        let (reply, done) = oneshot::channel();
        if self.request(Request::Close { reply }).is_err() {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }

    /// Wait until the node has closed
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        // Err means the actor is gone, which only happens after closing
        let _ = closed.wait_for(|c| *c).await;
    }

    fn request(&self, request: Request) -> Result<(), NodeError> {
        self.requests.send(request).map_err(|_| NodeError::Closed)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn validate_chance(chance: f64) -> Result<(), NodeError> {
    if (0.0..=1.0).contains(&chance) {
        Ok(())
    } else {
        Err(NodeError::InvalidChance(chance))
    }
}

/// The task that owns a node's state
struct NodeActor {
    address: ChannelId,
    bus: MessageBus,
    reactor: Reactor,
    publisher: Publisher,
    /// Mailbox sink handed to every subscription
    sink: Sink,
    control: Option<Subscription>,
    advertisement: Option<Subscription>,
    inputs: HashMap<ChannelId, Subscription>,
    wants_peer: bool,
    advertising_chance: f64,
    close_policy: ClosePolicy,
    closed: bool,
    rng: StdRng,
    stats: NodeStats,
    view: Arc<RwLock<NodeView>>,
    closed_tx: watch::Sender<bool>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut deliveries: mpsc::UnboundedReceiver<Envelope>,
        mut requests: mpsc::UnboundedReceiver<Request>,
    ) {
        while !self.closed {
            tokio::select! {
                biased;
                Some(request) = requests.recv() => self.handle_request(request).await,
                Some(envelope) = deliveries.recv() => self.handle_delivery(envelope).await,
                else => break,
            }
            self.publish_view();
        }

        // Whatever was queued while tearing down is dropped, not handled
        deliveries.close();
        while let Ok(envelope) = deliveries.try_recv() {
            self.ignore(&envelope);
        }
        requests.close();
        while let Ok(request) = requests.try_recv() {
            match request {
                Request::Close { reply } => {
                    let _ = reply.send(Ok(()));
                }
                Request::SetAdvertisingChance { .. } | Request::ResetWantsPeer { .. } => {}
            }
        }
        self.publish_view();
        debug!("Node {} stopped", self.address.short());
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::SetAdvertisingChance { chance, reply } => {
                debug!(
                    "Node {} advertising chance {} -> {}",
                    self.address.short(),
                    self.advertising_chance,
                    chance
                );
                self.advertising_chance = chance;
                let _ = reply.send(());
            }
            Request::ResetWantsPeer { reply } => {
                debug!("Node {} wants a peer again", self.address.short());
                self.wants_peer = true;
                let _ = reply.send(());
            }
            Request::Close { reply } => {
                let result = self.shutdown().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_delivery(&mut self, envelope: Envelope) {
        if self.closed {
            self.ignore(&envelope);
            return;
        }

        let result = match envelope.channel.as_str() {
            CONTROL_CHANNEL => self.handle_control(&envelope.body).await,
            ADVERTISEMENT_CHANNEL => self.handle_advertisement(&envelope.body),
            _ if self.inputs.contains_key(&envelope.channel) => {
                self.handle_payload(&envelope.channel, envelope.body);
                Ok(())
            }
            _ => {
                warn!(
                    "Node {} got a message on unknown channel {}",
                    self.address.short(),
                    envelope.channel.short()
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            self.stats.invalid_messages += 1;
            if e.is_invalid_command() {
                self.stats.invalid_commands += 1;
                warn!("Node {} dropped control message: {}", self.address.short(), e);
            } else {
                warn!(
                    "Node {} rejected message on {}: {}",
                    self.address.short(),
                    envelope.channel.short(),
                    e
                );
            }
        }
    }

    async fn handle_control(&mut self, body: &Payload) -> Result<(), NodeError> {
        match ControlMessage::from_json(body)? {
            ControlMessage::Tick => {
                self.handle_tick();
                Ok(())
            }
            ControlMessage::Close { address } => {
                let addressed = address == self.address;
                if addressed || self.close_policy == ClosePolicy::Broadcast {
                    if let Err(e) = self.shutdown().await {
                        warn!("Node {} closed with errors: {}", self.address.short(), e);
                    }
                } else {
                    trace!(
                        "Node {} ignoring close for {}",
                        self.address.short(),
                        address.short()
                    );
                }
                Ok(())
            }
        }
    }

    fn handle_tick(&mut self) {
        self.stats.ticks += 1;
        let d: f64 = self.rng.gen();
        if d < self.advertising_chance {
            let ad = Advertisement::new(self.address.clone());
            let reached = self.bus.publish(&ChannelId::advertisement(), ad.to_json());
            self.stats.advertisements_sent += 1;
            trace!(
                "Node {} advertised to {} listeners",
                self.address.short(),
                reached
            );
        }
    }

    fn handle_advertisement(&mut self, body: &Payload) -> Result<(), NodeError> {
        let ad = Advertisement::from_json(body)?;
        self.stats.advertisements_seen += 1;

        if ad.address == self.address {
            trace!("Node {} heard its own advertisement", self.address.short());
            return Ok(());
        }
        if ad.address.is_well_known() {
            warn!(
                "Node {} ignoring advertisement of reserved channel {}",
                self.address.short(),
                ad.address
            );
            return Ok(());
        }
        if !self.wants_peer || self.inputs.contains_key(&ad.address) {
            return Ok(());
        }

        let subscription = self.bus.subscribe(ad.address.clone(), self.sink.clone());
        info!(
            "Node {} wired to peer {}",
            self.address.short(),
            ad.address.short()
        );
        self.inputs.insert(ad.address, subscription);
        self.wants_peer = false;
        self.stats.peers_learned += 1;
        Ok(())
    }

    fn handle_payload(&mut self, channel: &ChannelId, payload: Payload) {
        match self.reactor.apply(payload) {
            Some(output) => match self.publisher.write(output) {
                Ok(reached) => {
                    self.stats.payloads_relayed += 1;
                    trace!(
                        "Node {} relayed payload from {} onto {} ({} listeners)",
                        self.address.short(),
                        channel.short(),
                        self.publisher.channel().short(),
                        reached
                    );
                }
                Err(e) => warn!("Node {} failed to relay: {}", self.address.short(), e),
            },
            None => self.stats.payloads_absorbed += 1,
        }
    }

    /// Enter the terminal state and release every bus resource.
    ///
    /// The closed flag is raised before any release starts; the result
    /// reflects whether every release succeeded.
    async fn shutdown(&mut self) -> Result<(), NodeError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.closed_tx.send_replace(true);

        let mut subscriptions: Vec<Subscription> = Vec::with_capacity(self.inputs.len() + 2);
        subscriptions.extend(self.control.take());
        subscriptions.extend(self.advertisement.take());
        subscriptions.extend(self.inputs.drain().map(|(_, sub)| sub));
        for sub in &subscriptions {
            trace!("Node {} releasing {}", self.address.short(), sub.channel().short());
        }

        let releases = join_all(subscriptions.into_iter().map(Subscription::release));
        let (published, released) = tokio::join!(self.publisher.close(), releases);

        let failures: Vec<BusError> = std::iter::once(published)
            .chain(released)
            .filter_map(Result::err)
            .collect();

        if failures.is_empty() {
            info!("Node {} closed", self.address.short());
            Ok(())
        } else {
            Err(NodeError::Teardown { failures })
        }
    }

    fn ignore(&mut self, envelope: &Envelope) {
        self.stats.ignored_after_close += 1;
        trace!(
            "Node {} closed, dropping message on {}",
            self.address.short(),
            envelope.channel.short()
        );
    }

    fn publish_view(&self) {
        let mut view = self.view.write();
        view.wants_peer = self.wants_peer;
        view.advertising_chance = self.advertising_chance;
        view.stats = self.stats.clone();
        if view.inputs.len() != self.inputs.len() {
            view.inputs = self.inputs.keys().cloned().collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(100);

    fn tick(bus: &MessageBus) {
        bus.publish(&ChannelId::control(), ControlMessage::Tick.to_json());
    }

    fn advertise(bus: &MessageBus, address: &str) {
        bus.publish(
            &ChannelId::advertisement(),
            Advertisement::new(ChannelId::from(address)).to_json(),
        );
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        timeout(WAIT, rx.recv())
            .await
            .expect("no message in time")
            .expect("stream ended")
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
        assert!(timeout(QUIET, rx.recv()).await.is_err(), "unexpected message");
    }

    #[tokio::test]
    async fn test_create_open() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::sink());

        assert!(!node.is_closed());
        assert!(node.wants_peer());
        assert!(!node.address().as_str().is_empty());
        assert!(!node.address().is_well_known());
        assert_eq!(node.advertising_chance(), 0.1);
        assert!(node.input_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_addresses_are_unique() {
        let bus = MessageBus::new();
        let nodes: Vec<Node> = (0..20).map(|_| Node::new(&bus, Reactor::identity())).collect();
        let addresses: HashSet<_> = nodes.iter().map(|n| n.address().clone()).collect();
        assert_eq!(addresses.len(), nodes.len());
        assert_eq!(bus.subscriber_count(&ChannelId::control()), 20);
    }

    #[tokio::test]
    async fn test_invalid_chance() {
        let bus = MessageBus::new();
        let config = NodeConfig::default().with_advertising_chance(1.5);
        assert!(matches!(
            Node::spawn(&bus, Reactor::identity(), config),
            Err(NodeError::InvalidChance(_))
        ));

        let node = Node::new(&bus, Reactor::identity());
        assert!(node.set_advertising_chance(f64::NAN).await.is_err());
        assert!(node.set_advertising_chance(-0.1).await.is_err());
        assert_eq!(node.advertising_chance(), 0.1);
    }

    #[tokio::test]
    async fn test_advertise() {
        let bus = MessageBus::new();
        let (_ads, mut ads_rx) = bus.subscribe_stream(ChannelId::advertisement());
        let node = Node::new(&bus, Reactor::sink());
        node.set_advertising_chance(1.0).await.unwrap();
        assert_eq!(node.advertising_chance(), 1.0);

        for _ in 0..5 {
            tick(&bus);
        }
        for _ in 0..5 {
            let ad = Advertisement::from_json(&next(&mut ads_rx).await.body).unwrap();
            assert_eq!(&ad.address, node.address());
        }
        assert_silent(&mut ads_rx).await;
        assert_eq!(node.stats().advertisements_sent, 5);
    }

    #[tokio::test]
    async fn test_never_advertises_at_zero_chance() {
        let bus = MessageBus::new();
        let (_ads, mut ads_rx) = bus.subscribe_stream(ChannelId::advertisement());
        let config = NodeConfig::default().with_advertising_chance(0.0);
        let node = Node::spawn(&bus, Reactor::identity(), config).unwrap();

        for _ in 0..200 {
            tick(&bus);
        }
        eventually(|| node.stats().ticks == 200).await;
        assert!(ads_rx.try_recv().is_err());
        assert_eq!(node.stats().advertisements_sent, 0);
    }

    #[tokio::test]
    async fn test_seeded_nodes_advertise_identically() {
        let bus = MessageBus::new();
        let config = NodeConfig::default()
            .with_advertising_chance(0.5)
            .with_seed(42);
        let a = Node::spawn(&bus, Reactor::sink(), config.clone()).unwrap();
        let b = Node::spawn(&bus, Reactor::sink(), config).unwrap();

        for _ in 0..64 {
            tick(&bus);
        }
        eventually(|| a.stats().ticks == 64 && b.stats().ticks == 64).await;
        assert_eq!(
            a.stats().advertisements_sent,
            b.stats().advertisements_sent
        );
    }

    #[tokio::test]
    async fn test_register() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::sink());
        let address = ChannelId::from("abc123");
        assert!(!node.is_listening(&address));

        advertise(&bus, "abc123");
        eventually(|| node.is_listening(&address)).await;
        assert!(!node.wants_peer());
        assert_eq!(bus.subscriber_count(&address), 1);
    }

    #[tokio::test]
    async fn test_first_advertisement_wins() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::sink());

        advertise(&bus, "first");
        advertise(&bus, "second");
        eventually(|| node.stats().advertisements_seen == 2).await;

        assert_eq!(node.input_addresses(), vec![ChannelId::from("first")]);
        assert_eq!(node.stats().peers_learned, 1);
    }

    #[tokio::test]
    async fn test_reset_wants_peer() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::sink());

        advertise(&bus, "first");
        eventually(|| !node.wants_peer()).await;

        node.reset_wants_peer().await.unwrap();
        assert!(node.wants_peer());

        // Already known: nothing to wire, still looking
        advertise(&bus, "first");
        advertise(&bus, "second");
        eventually(|| node.stats().advertisements_seen == 3).await;

        assert_eq!(
            node.input_addresses(),
            vec![ChannelId::from("first"), ChannelId::from("second")]
        );
        assert_eq!(bus.subscriber_count(&ChannelId::from("first")), 1);
        assert!(!node.wants_peer());
    }

    #[tokio::test]
    async fn test_ignores_own_advertisement() {
        let bus = MessageBus::new();
        let config = NodeConfig::default().with_advertising_chance(1.0);
        let node = Node::spawn(&bus, Reactor::identity(), config).unwrap();

        tick(&bus);
        eventually(|| node.stats().advertisements_seen == 1).await;

        assert!(node.wants_peer());
        assert!(node.input_addresses().is_empty());
        assert!(!node.is_listening(node.address()));
    }

    #[tokio::test]
    async fn test_ignores_reserved_channel_advertisement() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::identity());

        advertise(&bus, CONTROL_CHANNEL);
        eventually(|| node.stats().advertisements_seen == 1).await;
        assert!(node.wants_peer());
        assert_eq!(bus.subscriber_count(&ChannelId::control()), 1);
    }

    #[tokio::test]
    async fn test_handle() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::identity());
        let (_out, mut out_rx) = bus.subscribe_stream(node.address().clone());

        advertise(&bus, "abc123");
        eventually(|| node.is_listening(&ChannelId::from("abc123"))).await;

        bus.publish(&ChannelId::from("abc123"), json!({"hello": "world"}));
        let envelope = next(&mut out_rx).await;
        assert_eq!(&envelope.channel, node.address());
        assert_eq!(envelope.body, json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn test_delay_relay() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::delay());
        let (_out, mut out_rx) = bus.subscribe_stream(node.address().clone());
        let input = ChannelId::from("upstream");

        advertise(&bus, "upstream");
        eventually(|| node.is_listening(&input)).await;

        for n in ["a", "b", "c"] {
            bus.publish(&input, json!({ "n": n }));
        }
        assert_eq!(next(&mut out_rx).await.body, json!({"n": "a"}));
        assert_eq!(next(&mut out_rx).await.body, json!({"n": "b"}));
        assert_silent(&mut out_rx).await;

        let stats = node.stats();
        assert_eq!(stats.payloads_relayed, 2);
        assert_eq!(stats.payloads_absorbed, 1);
    }

    #[tokio::test]
    async fn test_sink_publishes_nothing() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::sink());
        let (_out, mut out_rx) = bus.subscribe_stream(node.address().clone());

        advertise(&bus, "upstream");
        eventually(|| !node.wants_peer()).await;
        bus.publish(&ChannelId::from("upstream"), json!({"dropped": true}));

        eventually(|| node.stats().payloads_absorbed == 1).await;
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_chained_relay() {
        let bus = MessageBus::new();
        let head = Node::new(&bus, Reactor::identity());
        let tail = Node::new(&bus, Reactor::identity());
        let (_out, mut out_rx) = bus.subscribe_stream(tail.address().clone());

        // Only the tail still looks for a peer when the head advertises
        advertise(&bus, "source");
        eventually(|| !head.wants_peer() && !tail.wants_peer()).await;
        tail.reset_wants_peer().await.unwrap();
        head.set_advertising_chance(1.0).await.unwrap();
        tick(&bus);
        eventually(|| tail.is_listening(head.address())).await;

        bus.publish(&ChannelId::from("source"), json!({"hop": 0}));
        // Once directly from the source, once more via the head
        assert_eq!(next(&mut out_rx).await.body, json!({"hop": 0}));
        assert_eq!(next(&mut out_rx).await.body, json!({"hop": 0}));
    }

    #[tokio::test]
    async fn test_close() {
        let bus = MessageBus::new();
        let (_ads, mut ads_rx) = bus.subscribe_stream(ChannelId::advertisement());
        let config = NodeConfig::default().with_advertising_chance(1.0);
        let node = Node::spawn(&bus, Reactor::identity(), config).unwrap();

        bus.publish(
            &ChannelId::control(),
            ControlMessage::close(node.address().clone()).to_json(),
        );
        timeout(WAIT, node.closed()).await.unwrap();
        assert!(node.is_closed());
        eventually(|| bus.subscriber_count(&ChannelId::control()) == 0).await;
        assert_eq!(bus.subscriber_count(&ChannelId::advertisement()), 1);

        tick(&bus);
        assert_silent(&mut ads_rx).await;

        advertise(&bus, "late");
        sleep(QUIET).await;
        assert!(!node.is_listening(&ChannelId::from("late")));
        assert_eq!(bus.subscriber_count(&ChannelId::from("late")), 0);
        assert!(matches!(
            node.set_advertising_chance(0.5).await,
            Err(NodeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::identity());

        node.close().await.unwrap();
        assert!(node.is_closed());
        node.close().await.unwrap();
        assert!(matches!(node.reset_wants_peer().await, Err(NodeError::Closed)));
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::identity());

        let (first, second) = tokio::join!(node.close(), node.close());
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(node.is_closed());
        eventually(|| bus.subscriber_count(&ChannelId::control()) == 0).await;
    }

    #[tokio::test]
    async fn test_messages_queued_behind_close_are_ignored() {
        let bus = MessageBus::new();
        let config = NodeConfig::default().with_advertising_chance(1.0);
        let node = Node::spawn(&bus, Reactor::identity(), config).unwrap();

        // All three land in the mailbox before the node runs
        bus.publish(
            &ChannelId::control(),
            ControlMessage::close(node.address().clone()).to_json(),
        );
        advertise(&bus, "late");
        tick(&bus);

        timeout(WAIT, node.closed()).await.unwrap();
        eventually(|| node.stats().ignored_after_close == 2).await;

        let stats = node.stats();
        assert_eq!(stats.ticks, 0);
        assert_eq!(stats.advertisements_seen, 0);
        assert_eq!(stats.advertisements_sent, 0);
        assert!(!node.is_listening(&ChannelId::from("late")));
        assert_eq!(bus.subscriber_count(&ChannelId::from("late")), 0);
    }

    #[tokio::test]
    async fn test_close_releases_inputs() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::identity());
        let input = ChannelId::from("upstream");

        advertise(&bus, "upstream");
        eventually(|| node.is_listening(&input)).await;
        node.close().await.unwrap();

        assert_eq!(bus.subscriber_count(&input), 0);
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_close_reports_failed_release() {
        let bus = MessageBus::new();
        let node = Node::new(&bus, Reactor::identity());
        let input = ChannelId::from("upstream");

        advertise(&bus, "upstream");
        eventually(|| node.is_listening(&input)).await;
        bus.remove_channel(&input);

        match node.close().await {
            Err(NodeError::Teardown { failures }) => {
                assert_eq!(failures, vec![BusError::NotSubscribed(input)]);
            }
            other => panic!("expected teardown failure, got {other:?}"),
        }
        assert!(node.is_closed());
        assert_eq!(bus.subscriber_count(&ChannelId::control()), 0);
    }

    #[tokio::test]
    async fn test_targeted_close() {
        let bus = MessageBus::new();
        let n1 = Node::new(&bus, Reactor::identity());
        let n2 = Node::new(&bus, Reactor::identity());

        bus.publish(
            &ChannelId::control(),
            ControlMessage::close(n1.address().clone()).to_json(),
        );
        timeout(WAIT, n1.closed()).await.unwrap();

        tick(&bus);
        eventually(|| n2.stats().ticks == 1).await;
        assert!(!n2.is_closed());
    }

    #[tokio::test]
    async fn test_broadcast_close() {
        let bus = MessageBus::new();
        let config = NodeConfig::default().with_close_policy(ClosePolicy::Broadcast);
        let n1 = Node::spawn(&bus, Reactor::identity(), config.clone()).unwrap();
        let n2 = Node::spawn(&bus, Reactor::identity(), config).unwrap();

        bus.publish(
            &ChannelId::control(),
            ControlMessage::close(n1.address().clone()).to_json(),
        );
        timeout(WAIT, n1.closed()).await.unwrap();
        timeout(WAIT, n2.closed()).await.unwrap();
        assert!(n2.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_command_is_not_fatal() {
        let bus = MessageBus::new();
        let (_ads, mut ads_rx) = bus.subscribe_stream(ChannelId::advertisement());
        let node = Node::new(&bus, Reactor::identity());

        bus.publish(&ChannelId::control(), json!({"command": "explode"}));
        bus.publish(&ChannelId::advertisement(), json!({"no": "address"}));
        node.set_advertising_chance(1.0).await.unwrap();
        tick(&bus);

        // The malformed advertisement arrives first on the stream
        next(&mut ads_rx).await;
        let ad = Advertisement::from_json(&next(&mut ads_rx).await.body).unwrap();
        assert_eq!(&ad.address, node.address());
        assert_eq!(node.stats().invalid_messages, 2);
        assert_eq!(node.stats().invalid_commands, 1);
        assert!(!node.is_closed());
    }

    #[test]
    fn test_invalid_command_classification() {
        let err = NodeError::from(brain_core::Error::InvalidCommand("explode".into()));
        assert!(err.is_invalid_command());
        assert!(!NodeError::Closed.is_invalid_command());
    }

    #[test]
    fn test_stats_accumulate() {
        let mut total = NodeStats::default();
        let one = NodeStats {
            ticks: 3,
            invalid_commands: 1,
            payloads_relayed: 2,
            ..Default::default()
        };
        total.accumulate(&one);
        total.accumulate(&one);
        assert_eq!(total.ticks, 6);
        assert_eq!(total.payloads_relayed, 4);
        assert_eq!(total.invalid_commands, 2);
    }
}
