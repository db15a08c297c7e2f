use std::path::Path;

use serde::{Deserialize, Serialize};
use soundcard_rt::{timing, BridgeMode, Presets, TimingTable, DEFAULT_SUB_BLOCK_COUNT};

use crate::error::ConfigError;

pub const DEFAULT_BPM: f64 = 120.0;
pub const DEFAULT_DELAY_FACTOR: f64 = 1.0 / 4.0;
pub const DEFAULT_RING_SLOTS: usize = 4;
pub const DEFAULT_WRITE_RETRIES: u32 = soundcard_io::blocking::DEFAULT_WRITE_RETRIES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundcardConfig {
    pub presets: Presets,
    pub bpm: f64,
    pub delay_factor: f64,
    /// `"n/m"` segmentation; overrides `delay_factor` when set.
    pub segmentation: Option<String>,
    pub ring_slots: usize,
    /// Sub-blocks per channel inside each slot.
    pub sub_block_count: usize,
    pub bridge_mode: BridgeMode,
    pub write_retries: u32,
    pub device: Option<String>,
    pub position_queue_capacity: usize,
    pub transport_queue_capacity: usize,
}

impl Default for SoundcardConfig {
    fn default() -> Self {
        Self {
            presets: Presets::default(),
            bpm: DEFAULT_BPM,
            delay_factor: DEFAULT_DELAY_FACTOR,
            segmentation: None,
            ring_slots: DEFAULT_RING_SLOTS,
            sub_block_count: DEFAULT_SUB_BLOCK_COUNT,
            bridge_mode: BridgeMode::Blocking,
            write_retries: DEFAULT_WRITE_RETRIES,
            device: None,
            position_queue_capacity: 256,
            transport_queue_capacity: 64,
        }
    }
}

impl SoundcardConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_presets(mut self, presets: Presets) -> Self {
        self.presets = presets;
        self
    }

    pub fn with_bpm(mut self, bpm: f64) -> Self {
        self.bpm = bpm;
        self
    }

    pub fn with_delay_factor(mut self, delay_factor: f64) -> Self {
        self.delay_factor = delay_factor;
        self.segmentation = None;
        self
    }

    pub fn with_segmentation<S: Into<String>>(mut self, segmentation: S) -> Self {
        self.segmentation = Some(segmentation.into());
        self
    }

    pub fn with_ring_slots(mut self, slots: usize) -> Self {
        self.ring_slots = slots;
        self
    }

    pub fn with_sub_block_count(mut self, count: usize) -> Self {
        self.sub_block_count = count;
        self
    }

    pub fn with_bridge_mode(mut self, mode: BridgeMode) -> Self {
        self.bridge_mode = mode;
        self
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }

    pub fn with_device<S: Into<String>>(mut self, device: S) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Delay factor after applying `segmentation`.
    pub fn effective_delay_factor(&self) -> Result<f64, ConfigError> {
        match &self.segmentation {
            Some(segmentation) => Ok(timing::delay_factor_from_segmentation(segmentation)?),
            None => Ok(self.delay_factor),
        }
    }

    pub fn timing_table(&self) -> Result<TimingTable, ConfigError> {
        Ok(TimingTable::compute(
            self.presets.samplerate,
            self.presets.buffer_size,
            self.bpm,
            self.effective_delay_factor()?,
        )?)
    }

    /// Rejects invalid values; nothing is clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.presets.validate()?;
        if !matches!(self.ring_slots, 4 | 8) {
            return Err(ConfigError::RingSlots(self.ring_slots));
        }
        if self.sub_block_count == 0 || self.sub_block_count > self.presets.buffer_size {
            return Err(ConfigError::Layout(format!(
                "sub-block count {} must be within 1..={}",
                self.sub_block_count, self.presets.buffer_size
            )));
        }
        if self.position_queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "position_queue_capacity",
            });
        }
        if self.transport_queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "transport_queue_capacity",
            });
        }
        self.timing_table()?;
        Ok(())
    }
}
