//! Streaming PCM16LE decoder with cross-chunk byte carry.
//!
//! Network chunks can split a 16-bit sample across a boundary. The decoder
//! holds a trailing odd byte and prepends it to the next chunk, so decoded
//! output is identical no matter where the transport cut the stream.

/// Decodes a stream of little-endian signed 16-bit PCM bytes into
/// normalized f32 samples.
#[derive(Debug, Default)]
pub struct PcmStreamDecoder {
    carry: Option<u8>,
}

impl PcmStreamDecoder {
    /// Create a fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk, carrying a trailing odd byte into the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut data = Vec::with_capacity(bytes.len() + 1);
        if let Some(carry) = self.carry.take() {
            data.push(carry);
        }
        data.extend_from_slice(bytes);

        if data.len() % 2 != 0 {
            self.carry = data.pop();
        }

        data.chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect()
    }

    /// Whether a partial sample is being held.
    pub fn has_partial(&self) -> bool {
        self.carry.is_some()
    }

    /// Discard any held partial byte.
    pub fn reset(&mut self) {
        self.carry = None;
    }
}
