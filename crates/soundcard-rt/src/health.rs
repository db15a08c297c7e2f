//! Lock-free counters describing how well the producer keeps up with the device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Health {
    rendered: AtomicU64,
    played: AtomicU64,
    captured: AtomicU64,
    overruns: AtomicU64,
    underruns: AtomicU64,
    late_renders: AtomicU64,
    max_render_us: AtomicU64,
    write_retries: AtomicU64,
    read_retries: AtomicU64,
    dropped_positions: AtomicU64,
    device_lost: AtomicBool,
}

/// Point-in-time copy of [`Health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub periods_rendered: u64,
    pub periods_played: u64,
    /// Periods a capture device read into the ring.
    pub periods_captured: u64,
    /// Periods dropped because every slot was pending.
    pub overruns: u64,
    /// Periods the device played as silence because no slot was ready.
    pub underruns: u64,
    pub late_renders: u64,
    pub max_render_us: u64,
    pub write_retries: u64,
    pub read_retries: u64,
    /// Position events lost because nobody drained the queue in time.
    pub dropped_positions: u64,
    pub device_lost: bool,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one committed period and how long rendering it took.
    ///
    /// Renders slower than `budget` count as late.
    #[inline]
    pub fn record_render(&self, elapsed: Duration, budget: Duration) {
        self.rendered.fetch_add(1, Ordering::Relaxed);
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.max_render_us.fetch_max(us, Ordering::Relaxed);
        if elapsed > budget {
            self.late_renders.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_played(&self) {
        self.played.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_captured(&self) {
        self.captured.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_write_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read_retry(&self) {
        self.read_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_position(&self) {
        self.dropped_positions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_device_lost(&self) {
        self.device_lost.store(true, Ordering::Release);
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::Acquire)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            periods_rendered: self.rendered.load(Ordering::Relaxed),
            periods_played: self.played.load(Ordering::Relaxed),
            periods_captured: self.captured.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            late_renders: self.late_renders.load(Ordering::Relaxed),
            max_render_us: self.max_render_us.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            read_retries: self.read_retries.load(Ordering::Relaxed),
            dropped_positions: self.dropped_positions.load(Ordering::Relaxed),
            device_lost: self.is_device_lost(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.rendered,
            &self.played,
            &self.captured,
            &self.overruns,
            &self.underruns,
            &self.late_renders,
            &self.max_render_us,
            &self.write_retries,
            &self.read_retries,
            &self.dropped_positions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.device_lost.store(false, Ordering::Release);
    }
}
