//! Live capture from a PipeWire source into the sample ring.
//!
//! ```text
//! Guitar interface ─▶ PipeWire graph ─▶ process callback (RT)
//!                                             │
//!                                             ▼
//!                                   RingProducer::write()
//!                                   (wait-free, never blocks)
//!                                             │
//!                                             ▼
//!                              InputPipeline::process_available()
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::ring::RingProducer;

/// Scratch space for one callback, in samples.
const SCRATCH_SAMPLES: usize = 16384;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// PipeWire node to capture from; `None` autoconnects to the default source.
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub channels: u32,
}

impl CaptureConfig {
    pub fn from_audio(audio: &perfconf::AudioConfig, device_name: Option<String>) -> Self {
        Self {
            device_name,
            sample_rate: audio.sample_rate,
            channels: audio.channels as u32,
        }
    }
}

#[derive(Debug, Default)]
pub struct CaptureStats {
    pub callbacks: AtomicU64,
    pub frames_captured: AtomicU64,
    /// Callbacks whose block did not fit in the ring.
    pub overruns: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Failed to initialize PipeWire: {0}")]
    InitFailed(String),

    #[error("Failed to create stream: {0}")]
    StreamFailed(String),

    #[error("Thread spawn failed: {0}")]
    ThreadFailed(#[from] std::io::Error),
}

/// Running capture stream. The PipeWire main loop lives on its own thread.
pub struct CaptureStream {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    config: CaptureConfig,
    stats: Arc<CaptureStats>,
}

impl CaptureStream {
    pub fn start(config: CaptureConfig, producer: RingProducer) -> Result<Self, CaptureError> {
        pipewire::init();

        debug!(
            "Creating capture stream: device={:?}, {}Hz, {}ch",
            config.device_name, config.sample_rate, config.channels
        );

        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CaptureStats::default());

        let thread_running = Arc::clone(&running);
        let thread_stats = Arc::clone(&stats);
        let thread_config = config.clone();

        let thread_handle = thread::Builder::new()
            .name("earshot-capture".to_string())
            .spawn(move || {
                if let Err(e) =
                    run_capture_loop(thread_config, producer, thread_running, thread_stats)
                {
                    error!("Capture thread failed: {}", e);
                }
            })?;

        info!(
            "Started capture: device={:?}, {}Hz, {}ch",
            config.device_name, config.sample_rate, config.channels
        );

        Ok(Self {
            running,
            thread_handle: Some(thread_handle),
            config,
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            // The main loop checks the flag on a 100ms timer
            thread::sleep(Duration::from_millis(100));
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CallbackState {
    producer: RingProducer,
    stats: Arc<CaptureStats>,
    scratch: Vec<f32>,
}

fn run_capture_loop(
    config: CaptureConfig,
    producer: RingProducer,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
) -> Result<(), CaptureError> {
    use pipewire as pw;
    use pw::spa::pod::Pod;
    use pw::{properties::properties, spa};
    use spa::param::audio::{AudioFormat, AudioInfoRaw};

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| CaptureError::InitFailed(format!("MainLoop: {:?}", e)))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| CaptureError::InitFailed(format!("Context: {:?}", e)))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| CaptureError::InitFailed(format!("Core connect: {:?}", e)))?;

    let name = config
        .device_name
        .clone()
        .unwrap_or_else(|| "earshot-input".to_string());

    let mut audio_info = AudioInfoRaw::new();
    audio_info.set_format(AudioFormat::F32LE);
    audio_info.set_rate(config.sample_rate);
    audio_info.set_channels(config.channels);

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(spa::pod::Object {
            type_: spa::sys::SPA_TYPE_OBJECT_Format,
            id: spa::sys::SPA_PARAM_EnumFormat,
            properties: audio_info.into(),
        }),
    )
    .map_err(|e| CaptureError::StreamFailed(format!("Pod serialize: {:?}", e)))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values)
        .ok_or_else(|| CaptureError::StreamFailed("Pod from bytes".to_string()))?;
    let mut params = [pod];

    let props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::AUDIO_CHANNELS => config.channels.to_string(),
    };

    let stream = pw::stream::StreamBox::new(&core, &name, props)
        .map_err(|e| CaptureError::StreamFailed(format!("Stream create: {:?}", e)))?;

    let channels = config.channels.max(1) as usize;
    let sample_size = std::mem::size_of::<f32>();
    let stride = sample_size * channels;

    let state = CallbackState {
        producer,
        stats,
        scratch: Vec::with_capacity(SCRATCH_SAMPLES),
    };

    let _listener = stream
        .add_local_listener_with_user_data(state)
        .process(move |stream, state| {
            state.stats.callbacks.fetch_add(1, Ordering::Relaxed);

            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let size = data.chunk().size() as usize;
            let Some(slice) = data.data() else {
                return;
            };

            // Whole frames that fit both the chunk and the scratch buffer
            let n_frames = (size.min(slice.len()) / stride).min(SCRATCH_SAMPLES / channels);
            if n_frames == 0 {
                return;
            }

            state.scratch.clear();
            state.scratch.extend(
                slice[..n_frames * stride]
                    .chunks_exact(sample_size)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );

            if state.producer.write(&state.scratch) {
                state
                    .stats
                    .frames_captured
                    .fetch_add(n_frames as u64, Ordering::Relaxed);
            } else {
                state.stats.overruns.fetch_add(1, Ordering::Relaxed);
            }
        })
        .register()
        .map_err(|e| CaptureError::StreamFailed(format!("Listener register: {:?}", e)))?;

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| CaptureError::StreamFailed(format!("Stream connect: {:?}", e)))?;

    info!("Capture stream connected to PipeWire");

    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if !running.load(Ordering::Acquire) {
            if let Some(ml) = mainloop_weak.upgrade() {
                ml.quit();
            }
        }
    });
    timer
        .update_timer(
            Some(Duration::from_millis(100)),
            Some(Duration::from_millis(100)),
        )
        .into_result()
        .map_err(|e| CaptureError::StreamFailed(format!("Failed to set timer: {}", e)))?;

    mainloop.run();

    info!("Capture stream stopped");
    Ok(())
}
