//! WAV (RIFF) header decoding for billing transcription uploads.
//!
//! Only the canonical 44-byte header is understood. Anything that does not decode to a
//! RIFF/WAVE header degrades to a byte-count estimate instead of failing the request.

use std::io::Read;

pub const WAV_HEADER_LEN: usize = 44;

/// Byte rate assumed for uploads that are not recognisable WAV files.
pub const FALLBACK_BYTE_RATE: f64 = 16_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavHeader {
    pub riff: [u8; 4],
    pub file_size: u32,
    pub wave: [u8; 4],
    pub fmt: [u8; 4],
    pub fmt_size: u32,
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub data: [u8; 4],
    pub data_size: u32,
}

impl WavHeader {
    pub fn from_bytes(raw: &[u8; WAV_HEADER_LEN]) -> Self {
        let tag = |at: usize| -> [u8; 4] { [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]] };
        let u32_at = |at: usize| u32::from_le_bytes(tag(at));
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);

        Self {
            riff: tag(0),
            file_size: u32_at(4),
            wave: tag(8),
            fmt: tag(12),
            fmt_size: u32_at(16),
            audio_format: u16_at(20),
            channels: u16_at(22),
            sample_rate: u32_at(24),
            byte_rate: u32_at(28),
            block_align: u16_at(32),
            bits_per_sample: u16_at(34),
            data: tag(36),
            data_size: u32_at(40),
        }
    }

    /// Reads exactly one header from `reader`, leaving it positioned after byte 44.
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut raw = [0u8; WAV_HEADER_LEN];
        reader.read_exact(&mut raw)?;
        Ok(Self::from_bytes(&raw))
    }

    pub fn has_valid_magic(&self) -> bool {
        &self.riff == b"RIFF" && &self.wave == b"WAVE"
    }

    /// Playback length in seconds, when the header can answer that.
    pub fn duration_seconds(&self) -> Option<f64> {
        if !self.has_valid_magic() || self.byte_rate == 0 {
            return None;
        }
        Some(f64::from(self.data_size) / f64::from(self.byte_rate))
    }
}

/// Billable duration of an upload whose header has been (or failed to be) read.
pub fn estimate_duration_seconds(header: Option<&WavHeader>, file_size_bytes: u64) -> f64 {
    header
        .and_then(WavHeader::duration_seconds)
        .unwrap_or_else(|| file_size_bytes as f64 / FALLBACK_BYTE_RATE)
}

/// Consumes the first 44 bytes of `reader` and estimates duration. A short read falls back to
/// the size-based estimate.
pub fn read_duration_seconds<R: Read>(reader: &mut R, file_size_bytes: u64) -> f64 {
    let header = WavHeader::read_from(reader).ok();
    estimate_duration_seconds(header.as_ref(), file_size_bytes)
}

#[cfg(test)]
pub(crate) fn encode_header(byte_rate: u32, data_size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(WAV_HEADER_LEN);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&(byte_rate / 2).to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    out
}
