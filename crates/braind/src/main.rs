//! braind - self-organizing gossip relay overlay daemon
//!
//! Spawns a population of relay nodes on an in-process bus, drives them with
//! periodic ticks, and reports how the overlay wires itself up.

use braind::config::Config;
use braind::driver::ControlDriver;
use braind::overlay::Overlay;
use brain_bus::MessageBus;
use clap::Parser;
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let default_level = if config.verbose { "braind=debug" } else { "braind=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "braind v{} - gossip relay overlay",
        env!("CARGO_PKG_VERSION")
    );

    let bus = MessageBus::new();
    let overlay = match Overlay::spawn(&bus, config.nodes, config.reactor, &config.node_config()) {
        Ok(overlay) => Arc::new(overlay),
        Err(e) => {
            error!("Failed to spawn overlay: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "{} nodes, tick every {:?}, advertising chance {}, {:?} close policy",
        overlay.len(),
        config.tick_interval(),
        config.advertising_chance,
        config.close_policy
    );

    let driver = ControlDriver::new(&bus);
    let ticker = driver.spawn_ticker(config.tick_interval());

    // Spawn pulse task
    let pulse = config.pulse.then(|| {
        let pulse_overlay = overlay.clone();
        let period = config.tick_interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            let mut seq = 0u64;
            loop {
                ticker.tick().await;
                pulse_overlay.inject(json!({ "pulse": seq }));
                seq += 1;
            }
        })
    });

    // Spawn report task
    let report_overlay = overlay.clone();
    let report_period = Duration::from_secs(config.report_interval_secs);
    let report = tokio::spawn(async move {
        let mut ticker = interval(report_period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = report_overlay.stats();
            info!(
                "Stats: {}/{} nodes wired, {} ads sent, {} payloads relayed, {} absorbed",
                stats.wired_count,
                stats.live_count,
                stats.totals.advertisements_sent,
                stats.totals.payloads_relayed,
                stats.totals.payloads_absorbed
            );
        }
    });

    match config.lifetime() {
        Some(lifetime) => {
            tokio::select! {
                _ = tokio::time::sleep(lifetime) => info!("Lifetime elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down...");
    if let Some(handle) = pulse {
        handle.abort();
    }
    report.abort();
    driver.shutdown();
    let ticks = ticker.await.unwrap_or_default();

    // Wiring is released on close, so report it first
    for entry in overlay.topology() {
        info!(
            "Node {} <- [{}]",
            entry.address.short(),
            entry
                .inputs
                .iter()
                .map(|i| i.short())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let shutdown = overlay.shutdown(&driver, Duration::from_secs(5)).await;

    let stats = overlay.stats();
    info!(
        "Final stats: {} ticks, {} nodes closed, {} peers learned, {} payloads relayed",
        ticks, shutdown.closed, stats.totals.peers_learned, stats.totals.payloads_relayed
    );

    if shutdown.stragglers.is_empty() {
        ExitCode::SUCCESS
    } else {
        error!("{} nodes failed to close", shutdown.stragglers.len());
        ExitCode::FAILURE
    }
}
