//! Sample formats and device presets.

use serde::{Deserialize, Serialize};

pub const MIN_CHANNELS: usize = 1;
pub const MAX_CHANNELS: usize = 64;
pub const MIN_SAMPLERATE: u32 = 8_000;
pub const MAX_SAMPLERATE: u32 = 192_000;
pub const MIN_BUFFER_SIZE: usize = 16;
pub const MAX_BUFFER_SIZE: usize = 8_192;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PresetsError {
    #[error("channel count {0} outside {MIN_CHANNELS}..={MAX_CHANNELS}")]
    Channels(usize),
    #[error("samplerate {0} Hz outside {MIN_SAMPLERATE}..={MAX_SAMPLERATE}")]
    Samplerate(u32),
    #[error("buffer size {0} outside {MIN_BUFFER_SIZE}..={MAX_BUFFER_SIZE}")]
    BufferSize(usize),
}

/// PCM word layout of one sample inside a slot.
///
/// 24 bit samples occupy a 32 bit word, as most drivers expect them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    S8,
    #[default]
    S16,
    S24,
    S32,
    S64,
    Float,
    Double,
}

impl SampleFormat {
    pub const fn word_size(self) -> usize {
        match self {
            SampleFormat::S8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24 | SampleFormat::S32 | SampleFormat::Float => 4,
            SampleFormat::S64 | SampleFormat::Double => 8,
        }
    }

    /// Encodes `sample` (nominal range -1.0..=1.0) into `out`, little endian.
    ///
    /// `out` must be exactly [`word_size`](Self::word_size) bytes long.
    #[inline]
    pub fn encode(self, sample: f32, out: &mut [u8]) {
        let clamped = sample.clamp(-1.0, 1.0) as f64;
        match self {
            SampleFormat::S8 => {
                out.copy_from_slice(&((clamped * i8::MAX as f64) as i8).to_le_bytes())
            }
            SampleFormat::S16 => {
                out.copy_from_slice(&((clamped * i16::MAX as f64) as i16).to_le_bytes())
            }
            SampleFormat::S24 => {
                out.copy_from_slice(&((clamped * 8_388_607.0) as i32).to_le_bytes())
            }
            SampleFormat::S32 => {
                out.copy_from_slice(&((clamped * i32::MAX as f64) as i32).to_le_bytes())
            }
            SampleFormat::S64 => {
                out.copy_from_slice(&((clamped * i64::MAX as f64) as i64).to_le_bytes())
            }
            SampleFormat::Float => out.copy_from_slice(&(clamped as f32).to_le_bytes()),
            SampleFormat::Double => out.copy_from_slice(&clamped.to_le_bytes()),
        }
    }

    /// Decodes one word written by [`encode`](Self::encode) back to `f32`.
    pub fn decode(self, word: &[u8]) -> f32 {
        fn array<const N: usize>(word: &[u8]) -> [u8; N] {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(&word[..N]);
            bytes
        }

        match self {
            SampleFormat::S8 => i8::from_le_bytes(array(word)) as f32 / i8::MAX as f32,
            SampleFormat::S16 => i16::from_le_bytes(array(word)) as f32 / i16::MAX as f32,
            SampleFormat::S24 => i32::from_le_bytes(array(word)) as f32 / 8_388_607.0,
            SampleFormat::S32 => (i32::from_le_bytes(array(word)) as f64 / i32::MAX as f64) as f32,
            SampleFormat::S64 => (i64::from_le_bytes(array(word)) as f64 / i64::MAX as f64) as f32,
            SampleFormat::Float => f32::from_le_bytes(array(word)),
            SampleFormat::Double => f64::from_le_bytes(array(word)) as f32,
        }
    }
}

/// Channel count, rate, period size and word format of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Presets {
    pub channels: usize,
    pub samplerate: u32,
    pub buffer_size: usize,
    pub format: SampleFormat,
}

impl Default for Presets {
    fn default() -> Self {
        Self {
            channels: 2,
            samplerate: 44_100,
            buffer_size: 1_024,
            format: SampleFormat::S16,
        }
    }
}

impl Presets {
    pub fn new(channels: usize, samplerate: u32, buffer_size: usize, format: SampleFormat) -> Self {
        Self {
            channels,
            samplerate,
            buffer_size,
            format,
        }
    }

    pub fn validate(&self) -> Result<(), PresetsError> {
        if !(MIN_CHANNELS..=MAX_CHANNELS).contains(&self.channels) {
            return Err(PresetsError::Channels(self.channels));
        }
        if !(MIN_SAMPLERATE..=MAX_SAMPLERATE).contains(&self.samplerate) {
            return Err(PresetsError::Samplerate(self.samplerate));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(PresetsError::BufferSize(self.buffer_size));
        }
        Ok(())
    }

    /// Bytes in one interleaved period.
    pub fn period_bytes(&self) -> usize {
        self.buffer_size * self.channels * self.format.word_size()
    }

    pub fn frame_bytes(&self) -> usize {
        self.channels * self.format.word_size()
    }

    pub fn period_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.buffer_size as f64 / self.samplerate as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_sizes_follow_storage_width() {
        assert_eq!(SampleFormat::S8.word_size(), 1);
        assert_eq!(SampleFormat::S24.word_size(), 4);
        assert_eq!(SampleFormat::Double.word_size(), 8);
    }

    #[test]
    fn encode_decode_keeps_sign_and_scale() {
        for format in [
            SampleFormat::S16,
            SampleFormat::S24,
            SampleFormat::S32,
            SampleFormat::Float,
        ] {
            let mut word = vec![0u8; format.word_size()];
            format.encode(-0.5, &mut word);
            let decoded = format.decode(&word);
            assert!((decoded + 0.5).abs() < 1.0e-3, "{format:?} decoded {decoded}");
        }
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let mut word = [0u8; 2];
        SampleFormat::S16.encode(4.0, &mut word);
        assert_eq!(i16::from_le_bytes(word), i16::MAX);
    }

    #[test]
    fn rejects_zero_buffer_size() {
        let presets = Presets {
            buffer_size: 0,
            ..Presets::default()
        };
        assert_eq!(presets.validate(), Err(PresetsError::BufferSize(0)));
        assert_eq!(Presets::default().period_bytes(), 1_024 * 2 * 2);
    }
}
