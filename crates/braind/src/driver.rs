//! Control driver
//!
//! Emits ticks on the control channel and addresses close commands to
//! individual nodes.

use brain_bus::{BusError, MessageBus, Publisher};
use brain_core::types::{ChannelId, ControlMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Publishes control traffic for an overlay
pub struct ControlDriver {
    control: Arc<Publisher>,
    /// Shutdown signal for spawned tickers
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlDriver {
    pub fn new(bus: &MessageBus) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            control: Arc::new(bus.publisher(ChannelId::control())),
            shutdown_tx,
        }
    }

    /// Publish one tick. Returns the number of listeners reached.
    pub fn tick(&self) -> Result<usize, BusError> {
        self.control.write(ControlMessage::Tick.to_json())
    }

    /// Publish a close command addressed to `address`
    pub fn close(&self, address: &ChannelId) -> Result<usize, BusError> {
        debug!("Requesting close of {}", address.short());
        self.control
            .write(ControlMessage::close(address.clone()).to_json())
    }

    /// Tick every `period` until [`ControlDriver::shutdown`] is called
    pub fn spawn_ticker(&self, period: Duration) -> JoinHandle<u64> {
        let control = self.control.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = 0u64;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if control.write(ControlMessage::Tick.to_json()).is_err() {
                            break;
                        }
                        ticks += 1;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            info!("Ticker stopped after {} ticks", ticks);
            ticks
        })
    }

    /// Stop spawned tickers
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
