//! Pedal board over ALSA MIDI (through midir).
//!
//! The midir callback thread maps CC messages to [`ControlInput`]s and
//! pushes them into a wait-free queue drained by the pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use midir::{MidiInput, MidiInputConnection};
use perfconf::PedalsConfig;
use tracing::{debug, info, warn};

use crate::control::{ControlInput, PedalMap};

#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    #[error("Failed to initialize MIDI: {0}")]
    InitFailed(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// A discovered MIDI input port.
#[derive(Debug, Clone)]
pub struct MidiPortInfo {
    pub index: usize,
    pub name: String,
}

pub fn list_midi_ports() -> Result<Vec<MidiPortInfo>, MidiError> {
    let midi_in =
        MidiInput::new("earshot-scan").map_err(|e| MidiError::InitFailed(e.to_string()))?;

    Ok(midi_in
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            midi_in
                .port_name(port)
                .ok()
                .map(|name| MidiPortInfo { index, name })
        })
        .collect())
}

struct PedalState {
    map: PedalMap,
    queue: rtrb::Producer<ControlInput>,
    received: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

/// Open connection to a pedal board. Dropping it closes the port.
pub struct PedalInput {
    connection: Option<MidiInputConnection<PedalState>>,
    pub port_name: String,
    received: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl PedalInput {
    /// Connect to the first input port whose name contains `port_pattern`.
    pub fn open(
        port_pattern: &str,
        pedals: PedalsConfig,
        queue: rtrb::Producer<ControlInput>,
    ) -> Result<Self, MidiError> {
        let midi_in =
            MidiInput::new("earshot-in").map_err(|e| MidiError::InitFailed(e.to_string()))?;

        let ports = midi_in.ports();
        let port = ports
            .iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.contains(port_pattern))
                    .unwrap_or(false)
            })
            .ok_or_else(|| MidiError::PortNotFound(port_pattern.to_string()))?;

        let port_name = midi_in
            .port_name(port)
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        let received = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let state = PedalState {
            map: PedalMap::new(pedals),
            queue,
            received: Arc::clone(&received),
            dropped: Arc::clone(&dropped),
        };

        let connection = midi_in
            .connect(
                port,
                "earshot-pedals",
                |_timestamp_us, data, state: &mut PedalState| {
                    state.received.fetch_add(1, Ordering::Relaxed);
                    if let Some(input) = state.map.map_bytes(data, perfbus::now_ns()) {
                        if state.queue.push(input).is_err() {
                            state.dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("Control queue full, dropping {:?}", input);
                        }
                    }
                },
                state,
            )
            .map_err(|e| MidiError::ConnectionFailed(e.to_string()))?;

        info!("Opened MIDI input: {}", port_name);

        Ok(Self {
            connection: Some(connection),
            port_name,
            received,
            dropped,
        })
    }

    pub fn messages_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Controls lost because the pipeline fell behind.
    pub fn controls_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            info!("Closed MIDI input: {}", self.port_name);
        }
    }
}

impl Drop for PedalInput {
    fn drop(&mut self) {
        let dropped = self.controls_dropped();
        if dropped > 0 {
            warn!("{} pedal controls dropped on {}", dropped, self.port_name);
        }
        self.close();
    }
}
