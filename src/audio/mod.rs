//! Audio I/O: microphone capture, PCM stream decoding, and scheduled
//! playback of streamed TTS audio.

pub mod capture;
pub mod pcm;
pub mod playback;
