//! Delay/attack tables reconciling the sample clock with musical ticks.
//!
//! A tick is 1/16 of a beat scaled by `1 / delay_factor`. Ticks rarely span a
//! whole number of periods, so every tick carries the frame inside its first
//! period at which it starts (`attack`) and the number of period boundaries
//! until the next tick starts (`delay`). The table covers [`PERIOD_COUNT`]
//! ticks and its total length is an exact multiple of the buffer size, so
//! cycling through it never drifts away from the sample clock.

use std::time::Duration;

use serde::Serialize;

/// Ticks in one table cycle.
pub const PERIOD_COUNT: usize = 64;
/// Fine attacks per tick (1/256 note resolution at the default delay factor).
pub const FINE_RESOLUTION: usize = 16;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimingError {
    #[error("invalid timing configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Tick {
    /// Period boundaries between the start of this tick and the next one.
    pub delay: u32,
    /// Frame offset of the tick start inside its period.
    pub attack: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingTable {
    samplerate: u32,
    buffer_size: usize,
    bpm: f64,
    delay_factor: f64,
    absolute_delay: f64,
    default_tact_frames: u64,
    total_frames: u64,
    ticks: Vec<Tick>,
    fine_256th: Vec<u32>,
}

impl TimingTable {
    pub fn compute(
        samplerate: u32,
        buffer_size: usize,
        bpm: f64,
        delay_factor: f64,
    ) -> Result<Self, TimingError> {
        if samplerate == 0 {
            return Err(invalid("samplerate must be greater than zero"));
        }
        if buffer_size == 0 {
            return Err(invalid("buffer size must be greater than zero"));
        }
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(invalid(format!("bpm must be positive, got {bpm}")));
        }
        if !delay_factor.is_finite() || delay_factor <= 0.0 {
            return Err(invalid(format!(
                "delay factor must be positive, got {delay_factor}"
            )));
        }

        let absolute_delay = absolute_delay(samplerate, buffer_size, bpm, delay_factor);
        let tact_frames = absolute_delay * buffer_size as f64;
        if !tact_frames.is_finite() || tact_frames >= u32::MAX as f64 {
            return Err(invalid(format!(
                "tick length of {tact_frames} frames is out of range"
            )));
        }
        let default_tact_frames = tact_frames.floor() as u64;

        let buffer = buffer_size as u64;
        let period = PERIOD_COUNT as u64;
        let total_frames = buffer * (period * default_tact_frames / buffer);
        if total_frames == 0 {
            return Err(invalid(format!(
                "{bpm} bpm at delay factor {delay_factor} leaves no whole period per table cycle"
            )));
        }

        let start = |tick: u64| tick * total_frames / period;
        let mut ticks = Vec::with_capacity(PERIOD_COUNT);
        for i in 0..period {
            let current = start(i);
            let next = start(i + 1);
            ticks.push(Tick {
                delay: (next / buffer - current / buffer) as u32,
                attack: (current % buffer) as u32,
            });
        }

        let fine_step = period * FINE_RESOLUTION as u64;
        let mut fine_256th = Vec::with_capacity(PERIOD_COUNT * FINE_RESOLUTION);
        for tick in &ticks {
            for j in 0..FINE_RESOLUTION as u64 {
                let offset = tick.attack as u64 + j * total_frames / fine_step;
                fine_256th.push((offset % buffer) as u32);
            }
        }

        Ok(Self {
            samplerate,
            buffer_size,
            bpm,
            delay_factor,
            absolute_delay,
            default_tact_frames,
            total_frames,
            ticks,
            fine_256th,
        })
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn delay_factor(&self) -> f64 {
        self.delay_factor
    }

    pub fn period_count(&self) -> usize {
        self.ticks.len()
    }

    /// Uncorrected periods per tick.
    pub fn absolute_delay(&self) -> f64 {
        self.absolute_delay
    }

    pub fn default_tact_frames(&self) -> u64 {
        self.default_tact_frames
    }

    /// Corrected tick length in frames; may be fractional.
    pub fn correct_frame_count(&self) -> f64 {
        self.total_frames as f64 / PERIOD_COUNT as f64
    }

    /// Frames covered by one full table cycle, a multiple of the buffer size.
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn ticks(&self) -> &[Tick] {
        &self.ticks
    }

    pub fn tick(&self, index: usize) -> Tick {
        self.ticks[index % self.ticks.len()]
    }

    pub fn delay(&self, index: usize) -> u32 {
        self.tick(index).delay
    }

    pub fn attack(&self, index: usize) -> u32 {
        self.tick(index).attack
    }

    /// The [`FINE_RESOLUTION`] sub-tick attacks of tick `index`.
    pub fn fine_256th(&self, index: usize) -> &[u32] {
        let index = index % self.ticks.len();
        &self.fine_256th[index * FINE_RESOLUTION..(index + 1) * FINE_RESOLUTION]
    }

    pub fn fine_256th_all(&self) -> &[u32] {
        &self.fine_256th
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(60.0 / (self.bpm * 16.0 * self.delay_factor))
    }

    /// Wall time elapsed after `note_offset_absolute` ticks.
    pub fn uptime(&self, note_offset_absolute: u64) -> Duration {
        self.tick_duration().mul_f64(note_offset_absolute as f64)
    }
}

/// Periods per tick before correction.
pub fn absolute_delay(samplerate: u32, buffer_size: usize, bpm: f64, delay_factor: f64) -> f64 {
    60.0 * ((samplerate as f64 / buffer_size as f64) / bpm) * ((1.0 / 16.0) * (1.0 / delay_factor))
}

/// Parses a `"numerator/denominator"` segmentation such as `"1/4"` into a delay factor.
pub fn delay_factor_from_segmentation(segmentation: &str) -> Result<f64, TimingError> {
    let (denominator, numerator) = segmentation
        .split_once('/')
        .ok_or_else(|| invalid(format!("segmentation {segmentation:?} is not n/m")))?;
    let denominator: f64 = denominator
        .trim()
        .parse()
        .map_err(|_| invalid(format!("segmentation {segmentation:?} is not n/m")))?;
    let numerator: f64 = numerator
        .trim()
        .parse()
        .map_err(|_| invalid(format!("segmentation {segmentation:?} is not n/m")))?;
    if denominator <= 0.0 || numerator <= 0.0 {
        return Err(invalid(format!(
            "segmentation {segmentation:?} must be positive"
        )));
    }
    Ok(1.0 / numerator * (numerator / denominator))
}

fn invalid(reason: impl Into<String>) -> TimingError {
    TimingError::InvalidConfiguration(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delay_factor_is_rejected() {
        let err = TimingTable::compute(44_100, 1_024, 120.0, 0.0).unwrap_err();
        assert!(matches!(err, TimingError::InvalidConfiguration(_)));
    }

    #[test]
    fn zero_buffer_size_and_bpm_are_rejected() {
        assert!(TimingTable::compute(44_100, 0, 120.0, 0.25).is_err());
        assert!(TimingTable::compute(44_100, 1_024, 0.0, 0.25).is_err());
        assert!(TimingTable::compute(0, 1_024, 120.0, 0.25).is_err());
    }

    #[test]
    fn segmentation_maps_to_delay_factor() {
        assert_eq!(delay_factor_from_segmentation("4/4").unwrap(), 1.0 / 4.0);
        assert_eq!(delay_factor_from_segmentation("1/4").unwrap(), 1.0);
        assert!(delay_factor_from_segmentation("four").is_err());
    }

    #[test]
    fn uptime_counts_sixteenth_notes_at_default_factor() {
        let table = TimingTable::compute(48_000, 512, 120.0, 0.25).unwrap();
        // 120 bpm, one tick per sixteenth -> 125 ms.
        assert_eq!(table.tick_duration(), Duration::from_millis(125));
        assert_eq!(table.uptime(8), Duration::from_secs(1));
    }
}
