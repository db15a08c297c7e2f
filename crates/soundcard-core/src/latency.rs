use serde::Serialize;

/// Output latency implied by the presets and ring depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyMetrics {
    pub round_trip_ms: f32,
    pub buffer_ms: f32,
    pub ring_ms: f32,
    pub ring_slots: usize,
}

impl LatencyMetrics {
    pub fn new(samplerate: u32, buffer_size: usize, ring_slots: usize) -> Self {
        let buffer_ms = buffer_size as f32 / samplerate as f32 * 1000.0;
        let ring_ms = buffer_ms * ring_slots as f32;
        Self {
            round_trip_ms: buffer_ms * 2.0 + ring_ms,
            buffer_ms,
            ring_ms,
            ring_slots,
        }
    }
}
