//! earshot - Performia live listener CLI
//!
//! Subcommands:
//! - `earshot listen --wav <file>` - Replay audio through the listener onto the bus
//! - `earshot monitor` - Print bus events as they arrive
//! - `earshot stats` - Bus counters and musical context as JSON
//! - `earshot calibrate --wav <file>` - Suggest an onset threshold
//! - `earshot config` - Print the effective configuration
//! - `earshot ports` - List MIDI input ports

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use earshot::{ChordLabel, ControlInput, InputPipeline, ListenerEvent, Mode, SystemCode};
use perfbus::{BusPoller, Event, EventBus, EventType, PollerConfig};
use perfconf::PerfConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "earshot")]
#[command(about = "Live listener for Performia")]
#[command(version)]
struct Cli {
    /// Config file (replaces ./performia.toml)
    #[arg(short, long, env = "PERFORMIA_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the listener and publish to the bus
    Listen {
        /// Replay this WAV file instead of live input
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Capture live from PipeWire
        #[cfg(feature = "pipewire")]
        #[arg(long, conflicts_with = "wav")]
        live: bool,

        /// PipeWire node to capture from
        #[cfg(feature = "pipewire")]
        #[arg(long, requires = "live")]
        device: Option<String>,

        /// Starting mode (overrides listener.initial_mode)
        #[arg(short, long)]
        mode: Option<String>,

        /// Create the bus segment, replacing a stale one
        #[arg(long)]
        create_bus: bool,

        /// Run without a bus; print listener events instead
        #[arg(long, conflicts_with = "create_bus")]
        no_bus: bool,
    },

    /// Print bus events until ctrl-c
    Monitor {
        /// Reader slot
        #[arg(short, long, default_value = "4")]
        slot: usize,

        /// Poll interval (defaults to bus.monitor_poll_ms)
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Print bus statistics as JSON
    Stats,

    /// Survey input levels and suggest an onset threshold
    Calibrate {
        #[arg(long)]
        wav: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Also list the files and variables it came from
        #[arg(long)]
        sources: bool,
    },

    /// List MIDI input ports
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = PerfConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for file in &sources.files {
        info!("Loaded config from {}", file.display());
    }

    match cli.command {
        #[cfg(feature = "pipewire")]
        Commands::Listen {
            wav,
            live,
            device,
            mode,
            create_bus,
            no_bus,
        } => {
            let bus = open_bus(&config, create_bus, no_bus)?;
            if live {
                listen_live(config, bus, mode.as_deref(), device).await?;
            } else {
                let wav = wav.context("--wav or --live is required")?;
                listen_wav(&config, bus, mode.as_deref(), &wav)?;
            }
        }
        #[cfg(not(feature = "pipewire"))]
        Commands::Listen {
            wav,
            mode,
            create_bus,
            no_bus,
        } => {
            let bus = open_bus(&config, create_bus, no_bus)?;
            let wav = wav.context("--wav is required (live capture needs the pipewire feature)")?;
            listen_wav(&config, bus, mode.as_deref(), &wav)?;
        }
        Commands::Monitor { slot, interval_ms } => {
            monitor(&config, slot, interval_ms).await?;
        }
        Commands::Stats => {
            let bus = EventBus::attach_in(&config.bus.shm_dir, &config.bus.name)
                .with_context(|| format!("Failed to attach to bus {}", config.bus.name))?;
            let report = serde_json::json!({
                "bus": bus.name(),
                "path": bus.path(),
                "active_readers": bus.active_readers(),
                "stats": bus.stats(),
                "context": bus.context(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Calibrate { wav } => {
            let report = earshot::calibrate_wav(&wav, config.audio.block_size)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.recommended_threshold > config.analysis.onset_threshold {
                warn!(
                    "Noise floor is high: recommended threshold {:.4} exceeds analysis.onset_threshold {:.4}",
                    report.recommended_threshold, config.analysis.onset_threshold
                );
            }
        }
        Commands::Config { sources: show } => {
            if show {
                for file in &sources.files {
                    println!("# file: {}", file.display());
                }
                for var in &sources.env_overrides {
                    println!("# env: {}", var);
                }
            }
            print!("{}", config.to_toml());
        }
        Commands::Ports => list_ports()?,
    }

    Ok(())
}

fn open_bus(config: &PerfConfig, create: bool, no_bus: bool) -> Result<Option<Arc<EventBus>>> {
    if no_bus {
        return Ok(None);
    }
    let bus = if create {
        EventBus::create_or_replace_in(&config.bus.shm_dir, &config.bus.name, config.bus.capacity)
            .with_context(|| format!("Failed to create bus {}", config.bus.name))?
    } else {
        EventBus::attach_in(&config.bus.shm_dir, &config.bus.name).with_context(|| {
            format!(
                "Failed to attach to bus {} (use --create-bus to create it)",
                config.bus.name
            )
        })?
    };
    Ok(Some(Arc::new(bus)))
}

fn close_bus(bus: Option<Arc<EventBus>>) -> Result<()> {
    let Some(bus) = bus else {
        return Ok(());
    };
    bus.flush()?;
    // Only the last handle in this process may unmap
    if let Ok(bus) = Arc::try_unwrap(bus) {
        if bus.is_owner() {
            bus.destroy()?;
        } else {
            bus.detach();
        }
    }
    Ok(())
}

fn build_pipeline(
    config: &PerfConfig,
    bus: &Option<Arc<EventBus>>,
    mode: Option<&str>,
) -> Result<(earshot::RingProducer, InputPipeline)> {
    let mut config = config.clone();
    if let Some(mode) = mode {
        if Mode::from_name(mode).is_none() {
            bail!("Unknown mode '{}'", mode);
        }
        config.listener.initial_mode = mode.to_string();
    }

    let (producer, mut pipeline) = InputPipeline::from_config(&config)?;
    if let Some(bus) = bus {
        pipeline = pipeline.with_bus(Arc::clone(bus));
    }
    Ok((producer, pipeline))
}

fn print_events(events: &[ListenerEvent]) {
    for event in events {
        match serde_json::to_string(event) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Could not render {}: {}", event.kind(), e),
        }
    }
}

fn listen_wav(
    config: &PerfConfig,
    bus: Option<Arc<EventBus>>,
    mode: Option<&str>,
    wav: &Path,
) -> Result<()> {
    let (mut producer, mut pipeline) = build_pipeline(config, &bus, mode)?;
    let echo = bus.is_none();

    let started = pipeline.apply_control(ControlInput::ListenStart);
    let summary = pipeline.replay_wav(&mut producer, wav)?;
    let stopped = pipeline.apply_control(ControlInput::ListenStop);
    if echo {
        print_events(&started);
        print_events(&stopped);
    }

    info!(
        "Replayed {} blocks, {} listener events, latency {:?}",
        summary.blocks,
        summary.events + started.len() as u64 + stopped.len() as u64,
        pipeline.latency()
    );
    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);

    drop(pipeline);
    close_bus(bus)
}

#[cfg(feature = "pipewire")]
async fn listen_live(
    config: PerfConfig,
    bus: Option<Arc<EventBus>>,
    mode: Option<&str>,
    device: Option<String>,
) -> Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};

    let (producer, pipeline) = build_pipeline(&config, &bus, mode)?;
    let (control_tx, control_rx) = rtrb::RingBuffer::<ControlInput>::new(64);
    let mut pipeline = pipeline.with_controls(control_rx);

    let _pedals = open_pedals(&config, control_tx);
    let capture = earshot::CaptureStream::start(
        earshot::CaptureConfig::from_audio(&config.audio, device),
        producer,
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let worker_running = Arc::clone(&running);
    let echo = bus.is_none();
    let block = Duration::from_secs_f64(
        config.audio.block_size as f64 / config.audio.sample_rate.max(1) as f64,
    );

    let worker = tokio::task::spawn_blocking(move || {
        while worker_running.load(Ordering::Acquire) {
            let events = pipeline.process_available();
            if echo {
                print_events(&events);
            }
            std::thread::sleep(block / 2);
        }
        let events = pipeline.apply_control(ControlInput::ListenStop);
        if echo {
            print_events(&events);
        }
        pipeline
    });

    info!("Listening; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    running.store(false, Ordering::Release);
    let pipeline = worker.await?;
    drop(capture);

    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    drop(pipeline);
    close_bus(bus)
}

#[cfg(all(feature = "pipewire", feature = "midi"))]
fn open_pedals(
    config: &PerfConfig,
    queue: rtrb::Producer<ControlInput>,
) -> Option<earshot::PedalInput> {
    if config.pedals.midi_port.is_empty() {
        info!("No pedals.midi_port configured; pedal input disabled");
        return None;
    }
    match earshot::PedalInput::open(&config.pedals.midi_port, config.pedals.clone(), queue) {
        Ok(pedals) => Some(pedals),
        Err(e) => {
            warn!("Pedal board unavailable: {}", e);
            None
        }
    }
}

#[cfg(all(feature = "pipewire", not(feature = "midi")))]
fn open_pedals(_config: &PerfConfig, _queue: rtrb::Producer<ControlInput>) -> Option<()> {
    info!("Built without the midi feature; pedal input disabled");
    None
}

async fn monitor(config: &PerfConfig, slot: usize, interval_ms: Option<u64>) -> Result<()> {
    let bus = Arc::new(
        EventBus::attach_in(&config.bus.shm_dir, &config.bus.name)
            .with_context(|| format!("Failed to attach to bus {}", config.bus.name))?,
    );

    let poller_config = PollerConfig {
        interval: Duration::from_millis(interval_ms.unwrap_or(config.bus.monitor_poll_ms)),
        ..PollerConfig::monitor(slot)
    };
    let (handle, mut events) = BusPoller::spawn(Arc::clone(&bus), poller_config);
    info!("Monitoring {} on slot {}; ctrl-c to stop", bus.name(), slot);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", describe(&event)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let summary = handle.stop().await;
    info!(
        "Monitor stopped after {} polls, {} events",
        summary.cycles, summary.forwarded
    );
    Ok(())
}

/// One line per event, decoding the payloads the listener packs into `reserved`.
fn describe(event: &Event) -> String {
    let detail = match event.event_type {
        EventType::Chord => ChordLabel::unpack(event.reserved)
            .map(|c| format!(" chord={}", c))
            .unwrap_or_default(),
        EventType::System | EventType::PatternChange => SystemCode::from_u64(event.reserved)
            .map(|code| format!(" system={:?}", code))
            .unwrap_or_default(),
        _ => String::new(),
    };
    format!("{}{}", event, detail)
}

#[cfg(feature = "midi")]
fn list_ports() -> Result<()> {
    let ports = earshot::list_midi_ports()?;
    if ports.is_empty() {
        println!("No MIDI input ports");
    }
    for port in ports {
        println!("{:>3}  {}", port.index, port.name);
    }
    Ok(())
}

#[cfg(not(feature = "midi"))]
fn list_ports() -> Result<()> {
    bail!("earshot was built without the midi feature")
}
