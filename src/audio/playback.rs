//! Scheduled playback of streamed TTS audio.
//!
//! Chunks arrive from the network with arbitrary jitter; playback must be
//! gapless anyway. A single "next start time" on the sink's audio clock is
//! advanced by each buffer's duration, so consecutive buffers are
//! back-to-back and never overlap. When the schedule has fallen behind the
//! clock (underrun), it re-anchors slightly ahead of now rather than
//! scheduling into the past.

use crate::audio::pcm::PcmStreamDecoder;
use crate::config::{AudioConfig, PlaybackConfig};
use crate::error::{Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Pure next-start-time bookkeeping for gapless scheduling.
#[derive(Debug)]
pub struct ChunkScheduler {
    next_start: f64,
    lead: f64,
}

impl ChunkScheduler {
    /// Create a scheduler with the configured underrun lead, in seconds.
    pub fn new(lead: f64) -> Self {
        Self {
            next_start: 0.0,
            lead,
        }
    }

    /// Re-anchor the schedule to the current clock time.
    pub fn anchor(&mut self, now: f64) {
        self.next_start = now;
    }

    /// Reserve a start time for a buffer of `duration` seconds.
    ///
    /// Returns the start time; advances `next_start` by the duration. When
    /// the previous schedule has already passed, the start re-anchors to
    /// `now + lead`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        if self.next_start < now {
            self.next_start = now + self.lead;
        }
        let start = self.next_start;
        self.next_start += duration;
        start
    }

    /// The time the next buffer would start at, absent an underrun.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

/// Output seam for scheduled audio.
///
/// The scheduler makes all timing decisions; a sink only owns the clock and
/// honours submitted (start-time, buffer) pairs. `halt` must silence and
/// release everything synchronously, including buffers not yet started.
pub trait PlaybackSink: Send + Sync {
    /// Prepare for a new response stream; discard any leftover audio.
    fn begin(&mut self);
    /// Current time in seconds on the sink's audio clock.
    fn now(&self) -> f64;
    /// Schedule `samples` (at `sample_rate`) to start at `start_at`.
    fn submit(&mut self, start_at: f64, samples: Vec<f32>, sample_rate: u32);
    /// Immediately stop and release all scheduled and active buffers.
    fn halt(&mut self);
    /// Whether any scheduled or active buffer remains.
    fn is_active(&self) -> bool;
}

/// Streamed-audio player: byte-carry decode, gapless schedule, hard stop.
pub struct StreamPlayer {
    decoder: PcmStreamDecoder,
    scheduler: ChunkScheduler,
    sink: Box<dyn PlaybackSink>,
    sample_rate: u32,
}

impl StreamPlayer {
    /// Create a player over the given sink.
    pub fn new(config: &PlaybackConfig, sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            decoder: PcmStreamDecoder::new(),
            scheduler: ChunkScheduler::new(config.underrun_lead_ms as f64 / 1000.0),
            sink,
            sample_rate: config.default_sample_rate,
        }
    }

    /// Create a player backed by the system's default output device.
    ///
    /// # Errors
    ///
    /// Returns an error when no usable output device exists.
    pub fn with_cpal(config: &PlaybackConfig, audio: &AudioConfig) -> Result<Self> {
        let sink = CpalSink::new(audio)?;
        Ok(Self::new(config, Box::new(sink)))
    }

    /// Reset for a new response stream: drop any partial decode and anchor
    /// the schedule at the current clock time.
    pub fn init(&mut self) {
        self.stop();
        self.sink.begin();
        self.scheduler.anchor(self.sink.now());
    }

    /// Set the sample rate reported by the stream for subsequent chunks.
    pub fn set_sample_rate(&mut self, rate: u32) {
        if rate != self.sample_rate {
            debug!("tts sample rate: {} -> {}", self.sample_rate, rate);
            self.sample_rate = rate;
        }
    }

    /// Decode and schedule one chunk of PCM16 bytes.
    pub fn play_chunk(&mut self, bytes: &[u8]) {
        let samples = self.decoder.feed(bytes);
        if samples.is_empty() {
            return;
        }
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let start = self.scheduler.schedule(self.sink.now(), duration);
        self.sink.submit(start, samples, self.sample_rate);
    }

    /// Silence and release everything immediately, discarding any pending
    /// partial sample byte.
    pub fn stop(&mut self) {
        self.decoder.reset();
        self.sink.halt();
    }

    /// Whether any scheduled or active buffer remains.
    pub fn is_active(&self) -> bool {
        self.sink.is_active()
    }

    /// The schedule's next start time, in seconds on the sink clock.
    pub fn next_start(&self) -> f64 {
        self.scheduler.next_start()
    }
}

/// One buffer scheduled on the output clock.
struct ScheduledBuffer {
    start_sample: u64,
    samples: Vec<f32>,
    pos: usize,
}

/// State shared with the cpal output callback.
#[derive(Default)]
struct SinkShared {
    queue: Vec<ScheduledBuffer>,
    /// Monotonic output-sample counter; the sink's clock.
    clock_samples: u64,
}

/// Real output sink: schedules buffers sample-accurately on a cpal stream.
pub struct CpalSink {
    shared: Arc<Mutex<SinkShared>>,
    device_rate: u32,
    _stream: cpal::Stream,
}

impl CpalSink {
    /// Open the configured (or default) output device.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::UnsupportedEnvironment`] when no output device
    /// is available or the stream cannot be built.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| {
                    VoiceError::UnsupportedEnvironment(format!("cannot enumerate devices: {e}"))
                })?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    VoiceError::UnsupportedEnvironment(format!("output device '{name}' not found"))
                })?
        } else {
            host.default_output_device().ok_or_else(|| {
                VoiceError::UnsupportedEnvironment("no default output device".into())
            })?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let default_config = device.default_output_config().map_err(|e| {
            VoiceError::UnsupportedEnvironment(format!("no default output config: {e}"))
        })?;
        let device_rate = default_config.sample_rate();
        let channels = default_config.channels();

        let stream_config = StreamConfig {
            channels,
            sample_rate: device_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(Mutex::new(SinkShared::default()));
        let shared_cb = Arc::clone(&shared);
        let ch = channels as usize;

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut guard = match shared_cb.lock() {
                        Ok(s) => s,
                        Err(_) => return,
                    };
                    let state = &mut *guard;
                    for frame in data.chunks_mut(ch) {
                        let mut value = 0.0f32;
                        for buf in &mut state.queue {
                            if buf.start_sample <= state.clock_samples
                                && buf.pos < buf.samples.len()
                            {
                                value += buf.samples[buf.pos];
                                buf.pos += 1;
                            }
                        }
                        for slot in frame {
                            *slot = value;
                        }
                        state.clock_samples += 1;
                    }
                    state.queue.retain(|b| b.pos < b.samples.len());
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| {
                VoiceError::UnsupportedEnvironment(format!("failed to build output stream: {e}"))
            })?;

        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("failed to start output stream: {e}")))?;

        Ok(Self {
            shared,
            device_rate,
            _stream: stream,
        })
    }
}

impl PlaybackSink for CpalSink {
    fn begin(&mut self) {
        self.halt();
    }

    fn now(&self) -> f64 {
        match self.shared.lock() {
            Ok(state) => state.clock_samples as f64 / self.device_rate as f64,
            Err(_) => 0.0,
        }
    }

    fn submit(&mut self, start_at: f64, samples: Vec<f32>, sample_rate: u32) {
        let samples = crate::audio::capture::resample_linear(&samples, sample_rate, self.device_rate);
        let start_sample = (start_at * self.device_rate as f64).round().max(0.0) as u64;
        match self.shared.lock() {
            Ok(mut state) => state.queue.push(ScheduledBuffer {
                start_sample,
                samples,
                pos: 0,
            }),
            Err(_) => warn!("playback sink lock poisoned, dropping buffer"),
        }
    }

    fn halt(&mut self) {
        if let Ok(mut state) = self.shared.lock() {
            state.queue.clear();
        }
    }

    fn is_active(&self) -> bool {
        match self.shared.lock() {
            Ok(state) => !state.queue.is_empty(),
            Err(_) => false,
        }
    }
}
