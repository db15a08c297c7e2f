use std::sync::Arc;

use soundcard_io::{Clock, PeriodIo};
use soundcard_rt::{
    BridgeMode, CallbackBridge, Health, Presets, RingBuffer, RingLayout, SampleFormat, TimingTable,
};

/// 48 kHz stereo with 10 ms periods.
pub fn presets() -> Presets {
    Presets::new(2, 48_000, 480, SampleFormat::S16)
}

pub fn period_io(mode: BridgeMode) -> PeriodIo {
    let presets = presets();
    let ring = RingBuffer::new(RingLayout::new(4, presets, 2)).unwrap();
    let table = TimingTable::compute(presets.samplerate, presets.buffer_size, 120.0, 0.25).unwrap();
    PeriodIo::new(
        Arc::new(ring),
        Arc::new(Clock::new(table, 64, 16)),
        Arc::new(CallbackBridge::new(mode)),
        Arc::new(Health::new()),
    )
}
