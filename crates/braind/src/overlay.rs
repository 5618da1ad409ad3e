//! Overlay host - runs a population of nodes on one bus

use crate::config::NodeConfig;
use crate::driver::ControlDriver;
use crate::node::{Node, NodeError, NodeStats};
use brain_bus::MessageBus;
use brain_core::reactor::{Reactor, ReactorKind};
use brain_core::types::{ChannelId, Payload};
use futures::future::join_all;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A set of nodes sharing one bus
pub struct Overlay {
    bus: MessageBus,
    nodes: Vec<Node>,
}

/// One node's position in the overlay
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyEntry {
    pub address: ChannelId,
    pub inputs: Vec<ChannelId>,
    pub closed: bool,
}

/// Overlay statistics
#[derive(Debug, Clone, Default)]
pub struct OverlayStats {
    pub node_count: usize,
    pub live_count: usize,
    /// Live nodes with at least one input channel
    pub wired_count: usize,
    pub totals: NodeStats,
}

/// Outcome of closing every node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: usize,
    /// Nodes still open when the wait ran out
    pub stragglers: Vec<ChannelId>,
}

impl Overlay {
    /// Spawn `count` nodes, each with a fresh reactor of `kind`.
    ///
    /// A seeded config gives every node its own seed derived from the base.
    pub fn spawn(
        bus: &MessageBus,
        count: usize,
        kind: ReactorKind,
        config: &NodeConfig,
    ) -> Result<Self, NodeError> {
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let mut node_config = config.clone();
            node_config.rng_seed = config.rng_seed.map(|seed| seed.wrapping_add(i as u64));
            nodes.push(Node::spawn(bus, Reactor::from_kind(kind), node_config)?);
        }
        info!("Spawned {} {} nodes", count, kind);

        Ok(Self {
            bus: bus.clone(),
            nodes,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current wiring of every node
    pub fn topology(&self) -> Vec<TopologyEntry> {
        self.nodes
            .iter()
            .map(|node| TopologyEntry {
                address: node.address().clone(),
                inputs: node.input_addresses(),
                closed: node.is_closed(),
            })
            .collect()
    }

    /// Aggregate statistics
    pub fn stats(&self) -> OverlayStats {
        let mut stats = OverlayStats {
            node_count: self.nodes.len(),
            ..Default::default()
        };
        for node in &self.nodes {
            if !node.is_closed() {
                stats.live_count += 1;
                if !node.input_addresses().is_empty() {
                    stats.wired_count += 1;
                }
            }
            stats.totals.accumulate(&node.stats());
        }
        stats
    }

    /// Publish `payload` on the output channel of the first live node.
    ///
    /// Returns the number of listeners reached.
    pub fn inject(&self, payload: Payload) -> usize {
        match self.nodes.iter().find(|n| !n.is_closed()) {
            Some(node) => self.bus.publish(node.address(), payload),
            None => 0,
        }
    }

    /// Send a close command to every live node and wait up to `wait` for
    /// all of them to reach the closed state.
    pub async fn shutdown(&self, driver: &ControlDriver, wait: Duration) -> ShutdownReport {
        for node in self.nodes.iter().filter(|n| !n.is_closed()) {
            if let Err(e) = driver.close(node.address()) {
                warn!("Could not request close of {}: {}", node.address().short(), e);
            }
        }

        let _ = timeout(wait, join_all(self.nodes.iter().map(|n| n.closed()))).await;

        let stragglers: Vec<ChannelId> = self
            .nodes
            .iter()
            .filter(|n| !n.is_closed())
            .map(|n| n.address().clone())
            .collect();
        for address in &stragglers {
            warn!("Node {} did not close in time", address.short());
        }
        debug!("Overlay shutdown: {} stragglers", stragglers.len());

        ShutdownReport {
            closed: self.nodes.len() - stragglers.len(),
            stragglers,
        }
    }
}
