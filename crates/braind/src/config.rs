//! Configuration for braind

use brain_core::reactor::ReactorKind;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default probability that a tick makes a node advertise itself
pub const DEFAULT_ADVERTISING_CHANCE: f64 = 0.1;

/// braind - self-organizing gossip relay overlay
#[derive(Parser, Debug, Clone)]
#[command(name = "braind")]
#[command(author, version, about = "Self-organizing gossip relay overlay daemon", long_about = None)]
pub struct Config {
    /// Number of nodes to spawn
    #[arg(short, long, default_value = "16", env = "BRAIN_NODES")]
    pub nodes: usize,

    /// Tick interval in milliseconds
    #[arg(long, default_value = "250")]
    pub tick_interval_ms: u64,

    /// Probability in [0, 1] that a tick makes a node advertise
    #[arg(long, default_value_t = DEFAULT_ADVERTISING_CHANCE)]
    pub advertising_chance: f64,

    /// Reactor applied by every node (identity, delay, sink)
    #[arg(long, default_value = "identity")]
    pub reactor: ReactorKind,

    /// Which nodes a close command tears down
    #[arg(long, value_enum, default_value = "targeted")]
    pub close_policy: ClosePolicy,

    /// Seed for reproducible advertising decisions
    #[arg(long, env = "BRAIN_SEED")]
    pub seed: Option<u64>,

    /// Run for this many seconds, then shut down (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub lifetime_secs: u64,

    /// Inject a counter payload into the overlay every tick
    #[arg(long)]
    pub pulse: bool,

    /// Topology report interval in seconds
    #[arg(long, default_value = "5")]
    pub report_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nodes == 0 {
            anyhow::bail!("At least one node is required");
        }
        if !(0.0..=1.0).contains(&self.advertising_chance) {
            anyhow::bail!(
                "Advertising chance must lie in [0, 1], got {}",
                self.advertising_chance
            );
        }
        if self.tick_interval_ms == 0 {
            anyhow::bail!("Tick interval must be positive");
        }
        if self.report_interval_secs == 0 {
            anyhow::bail!("Report interval must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Run duration, if bounded
    pub fn lifetime(&self) -> Option<Duration> {
        (self.lifetime_secs > 0).then(|| Duration::from_secs(self.lifetime_secs))
    }

    /// Per-node settings derived from the daemon flags
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            advertising_chance: self.advertising_chance,
            close_policy: self.close_policy,
            rng_seed: self.seed,
        }
    }
}

/// How a node interprets `{"command": "close", "address": ...}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosePolicy {
    /// Only the node whose output address matches closes
    #[default]
    Targeted,
    /// Every node closes on any close command
    Broadcast,
}

/// Per-node tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Probability in [0, 1] that a tick triggers an advertisement
    pub advertising_chance: f64,
    /// Close command interpretation
    pub close_policy: ClosePolicy,
    /// Seed for the advertising random source (entropy when absent)
    pub rng_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            advertising_chance: DEFAULT_ADVERTISING_CHANCE,
            close_policy: ClosePolicy::default(),
            rng_seed: None,
        }
    }
}

impl NodeConfig {
    pub fn with_advertising_chance(mut self, chance: f64) -> Self {
        self.advertising_chance = chance;
        self
    }

    pub fn with_close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}
