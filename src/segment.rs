//! Speech segment recording and encoding.
//!
//! One recorder instance accumulates raw samples for the duration of a
//! detected speech burst. On stop, the buffer is encoded into a blob in the
//! session's negotiated format, or discarded when the burst was too short
//! to contain usable speech.

use crate::config::SegmentConfig;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Container/codec pair used to encode a segment for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
    /// WAV container, 16-bit PCM.
    WavPcm16,
    /// Bare little-endian 16-bit PCM, no container.
    RawPcm16,
}

/// Preference order for segment encoding. The first supported entry wins
/// and stays fixed for the whole session.
const FORMAT_PREFERENCE: &[SegmentFormat] = &[SegmentFormat::WavPcm16, SegmentFormat::RawPcm16];

impl SegmentFormat {
    /// Pick the session encoding format: first supported preference entry.
    pub fn negotiate() -> Self {
        FORMAT_PREFERENCE
            .iter()
            .copied()
            .find(|f| f.is_supported())
            .unwrap_or(SegmentFormat::RawPcm16)
    }

    fn is_supported(self) -> bool {
        match self {
            SegmentFormat::WavPcm16 | SegmentFormat::RawPcm16 => true,
        }
    }

    /// MIME type for upload.
    pub fn mime(self) -> &'static str {
        match self {
            SegmentFormat::WavPcm16 => "audio/wav",
            SegmentFormat::RawPcm16 => "application/octet-stream",
        }
    }

    /// Upload file name.
    pub fn file_name(self) -> &'static str {
        match self {
            SegmentFormat::WavPcm16 => "audio.wav",
            SegmentFormat::RawPcm16 => "audio.pcm",
        }
    }
}

/// One encoded speech burst, ready for transcription.
#[derive(Debug, Clone)]
pub struct AudioSegment {
    /// Encoded payload.
    pub data: Vec<u8>,
    /// Encoding of `data`.
    pub format: SegmentFormat,
    /// When speech onset was detected.
    pub started_at: Instant,
    /// When the segment was finalized.
    pub ended_at: Instant,
}

impl AudioSegment {
    /// Wall-clock duration of the burst.
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }
}

/// Records raw speech audio for the duration of one detected segment.
pub struct SegmentRecorder {
    format: SegmentFormat,
    sample_rate: u32,
    min_speech: Duration,
    buffer: Vec<f32>,
    started_at: Option<Instant>,
}

impl SegmentRecorder {
    /// Create a recorder. The encoding format is negotiated here, once per
    /// session.
    pub fn new(config: &SegmentConfig, sample_rate: u32) -> Self {
        let format = SegmentFormat::negotiate();
        debug!("segment recorder: format={format:?}, rate={sample_rate}Hz");
        Self {
            format,
            sample_rate,
            min_speech: Duration::from_millis(config.min_speech_ms),
            buffer: Vec::new(),
            started_at: None,
        }
    }

    /// Begin capturing a new segment.
    pub fn start(&mut self, at: Instant) {
        self.buffer.clear();
        self.started_at = Some(at);
    }

    /// Append captured samples to the current segment. No-op when idle.
    pub fn push(&mut self, samples: &[f32]) {
        if self.started_at.is_some() {
            self.buffer.extend_from_slice(samples);
        }
    }

    /// Whether a segment is currently being captured.
    pub fn is_recording(&self) -> bool {
        self.started_at.is_some()
    }

    /// Finalize the segment into an encoded blob.
    ///
    /// Returns `None` when no segment was active, when the burst was
    /// shorter than the minimum speech duration, or when encoding failed
    /// (logged; the session continues).
    pub fn stop(&mut self, at: Instant) -> Option<AudioSegment> {
        let started_at = self.started_at.take()?;
        let samples = std::mem::take(&mut self.buffer);

        let duration = at.saturating_duration_since(started_at);
        if duration < self.min_speech {
            debug!("discarding {}ms segment (below minimum)", duration.as_millis());
            return None;
        }

        let data = match encode(self.format, self.sample_rate, &samples) {
            Ok(data) => data,
            Err(e) => {
                warn!("segment encoding failed, dropping segment: {e}");
                return None;
            }
        };

        Some(AudioSegment {
            data,
            format: self.format,
            started_at,
            ended_at: at,
        })
    }

    /// Drop any partial segment without encoding it.
    pub fn abort(&mut self) {
        self.buffer.clear();
        self.started_at = None;
    }
}

fn encode(format: SegmentFormat, sample_rate: u32, samples: &[f32]) -> crate::Result<Vec<u8>> {
    match format {
        SegmentFormat::WavPcm16 => encode_wav(sample_rate, samples),
        SegmentFormat::RawPcm16 => Ok(samples
            .iter()
            .flat_map(|s| to_i16(*s).to_le_bytes())
            .collect()),
    }
}

fn encode_wav(sample_rate: u32, samples: &[f32]) -> crate::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|e| crate::VoiceError::Audio(format!("wav writer: {e}")))?;
    for sample in samples {
        writer
            .write_sample(to_i16(*sample))
            .map_err(|e| crate::VoiceError::Audio(format!("wav write: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| crate::VoiceError::Audio(format!("wav finalize: {e}")))?;
    Ok(cursor.into_inner())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}
