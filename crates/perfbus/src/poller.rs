//! Async reader tasks.
//!
//! Each poller owns one reader slot, drains it on a fixed cadence, and
//! forwards events over a bounded channel. Cancellation is checked between
//! cycles and while a send waits on a full channel.

use crate::bus::EventBus;
use crate::event::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub slot: usize,
    /// Minimum time between polls.
    pub interval: Duration,
    /// Max events read per cycle.
    pub batch: usize,
    pub channel_capacity: usize,
    /// Register the slot on start and release it on exit.
    pub register: bool,
}

impl PollerConfig {
    /// Synthesis-side cadence.
    pub fn realtime(slot: usize) -> Self {
        Self {
            slot,
            interval: Duration::from_micros(500),
            batch: 256,
            channel_capacity: 4096,
            register: true,
        }
    }

    /// UI/monitor cadence (10 Hz).
    pub fn monitor(slot: usize) -> Self {
        Self {
            slot,
            interval: Duration::from_millis(100),
            batch: 1024,
            channel_capacity: 4096,
            register: true,
        }
    }
}

/// Totals reported when a poller exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerSummary {
    pub cycles: u64,
    pub forwarded: u64,
}

pub struct PollerHandle {
    cancel: CancellationToken,
    join: JoinHandle<PollerSummary>,
}

impl PollerHandle {
    /// Ask the task to stop; undelivered events in the current batch are dropped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that stops this poller when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel and wait for the task to finish.
    pub async fn stop(self) -> PollerSummary {
        self.cancel.cancel();
        self.join.await.unwrap_or_else(|e| {
            warn!("Bus poller task failed: {}", e);
            PollerSummary::default()
        })
    }
}

pub struct BusPoller;

impl BusPoller {
    /// Spawn a poller on the current tokio runtime.
    pub fn spawn(bus: Arc<EventBus>, config: PollerConfig) -> (PollerHandle, mpsc::Receiver<Event>) {
        Self::spawn_with_token(bus, config, CancellationToken::new())
    }

    /// Spawn a poller stopped by `cancel` (e.g. a child of a process-wide token).
    pub fn spawn_with_token(
        bus: Arc<EventBus>,
        config: PollerConfig,
        cancel: CancellationToken,
    ) -> (PollerHandle, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move { run(bus, config, tx, task_cancel).await });
        (PollerHandle { cancel, join }, rx)
    }
}

async fn run(
    bus: Arc<EventBus>,
    config: PollerConfig,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> PollerSummary {
    let mut summary = PollerSummary::default();

    if config.register {
        if let Err(e) = bus.register_reader(config.slot) {
            warn!("Bus poller could not register slot {}: {}", config.slot, e);
            return summary;
        }
    }
    debug!(
        "Bus poller on {} slot {} every {:?}",
        bus.name(),
        config.slot,
        config.interval
    );

    let mut batch = Vec::with_capacity(config.batch);
    'poll: loop {
        batch.clear();
        if let Err(e) = bus.read_into(config.slot, config.batch, &mut batch) {
            warn!("Bus poller read failed: {}", e);
            break;
        }
        summary.cycles += 1;

        for event in batch.drain(..) {
            // A full channel must not keep the poller alive past cancellation
            tokio::select! {
                _ = cancel.cancelled() => break 'poll,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        debug!("Bus poller receiver dropped");
                        break 'poll;
                    }
                    summary.forwarded += 1;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    if config.register {
        if let Err(e) = bus.release_reader(config.slot) {
            warn!("Bus poller could not release slot {}: {}", config.slot, e);
        }
    }
    debug!(
        "Bus poller slot {} stopped after {} cycles, {} events",
        config.slot, summary.cycles, summary.forwarded
    );
    summary
}
