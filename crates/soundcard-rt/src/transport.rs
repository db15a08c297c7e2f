//! Musical position advanced once per consumed period.

use serde::{Deserialize, Serialize};

use crate::timing::{TimingTable, FINE_RESOLUTION};

pub const DEFAULT_LOOP_LEFT: u64 = 0;
pub const DEFAULT_LOOP_RIGHT: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("loop region {left}..{right} is empty")]
    InvalidLoop { left: u64, right: u64 },
}

/// Loop region, left inclusive and right exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRegion {
    pub left: u64,
    pub right: u64,
    pub enabled: bool,
}

impl Default for LoopRegion {
    fn default() -> Self {
        Self {
            left: DEFAULT_LOOP_LEFT,
            right: DEFAULT_LOOP_RIGHT,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    SetNoteOffset(u64),
    SetNoteOffsetAbsolute(u64),
    SetStartNoteOffset(u64),
    SetLoop(LoopRegion),
    Rewind,
}

/// Position published after every tick boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub note_offset: u64,
    pub note_offset_absolute: u64,
    pub tic: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TransportState {
    tact_counter: u64,
    delay_counter: u32,
    tic_counter: usize,
    note_offset: u64,
    note_offset_absolute: u64,
    start_note_offset: u64,
    loop_region: LoopRegion,
    loop_offset: u64,
}

impl TransportState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for one consumed period and returns the tick boundaries crossed.
    ///
    /// Must run exactly once per period handed to the device. Ticks with a
    /// zero delay start and end inside the same period, so more than one
    /// boundary may be crossed.
    pub fn advance_tick(&mut self, table: &TimingTable) -> u32 {
        let period_count = table.period_count();
        self.tic_counter %= period_count;
        self.delay_counter += 1;

        let mut crossed = 0;
        while self.delay_counter >= table.delay(self.tic_counter) {
            self.delay_counter -= table.delay(self.tic_counter);
            self.tic_counter = (self.tic_counter + 1) % period_count;
            self.tact_counter += 1;
            self.note_offset = self.next_note_offset();
            self.note_offset_absolute += 1;
            crossed += 1;
        }
        crossed
    }

    fn next_note_offset(&self) -> u64 {
        let next = self.note_offset + 1;
        let region = self.loop_region;
        if region.enabled && self.note_offset < region.right && next >= region.right {
            region.left
        } else {
            next
        }
    }

    pub fn apply(&mut self, command: TransportCommand) -> Result<(), TransportError> {
        match command {
            TransportCommand::SetNoteOffset(offset) => self.note_offset = offset,
            TransportCommand::SetNoteOffsetAbsolute(offset) => self.note_offset_absolute = offset,
            TransportCommand::SetStartNoteOffset(offset) => self.start_note_offset = offset,
            TransportCommand::SetLoop(region) => self.set_loop(region)?,
            TransportCommand::Rewind => self.rewind(),
        }
        Ok(())
    }

    /// Moves back to the start note offset and clears the tick counters.
    pub fn rewind(&mut self) {
        self.tact_counter = 0;
        self.delay_counter = 0;
        self.tic_counter = 0;
        self.note_offset = self.start_note_offset;
        self.note_offset_absolute = self.start_note_offset;
    }

    pub fn set_loop(&mut self, region: LoopRegion) -> Result<(), TransportError> {
        if region.enabled && region.left >= region.right {
            return Err(TransportError::InvalidLoop {
                left: region.left,
                right: region.right,
            });
        }
        if region.enabled {
            self.loop_offset = self.note_offset;
        }
        self.loop_region = region;
        Ok(())
    }

    pub fn loop_region(&self) -> LoopRegion {
        self.loop_region
    }

    /// Note offset at the moment looping was last enabled.
    pub fn loop_offset(&self) -> u64 {
        self.loop_offset
    }

    pub fn set_note_offset(&mut self, offset: u64) {
        self.note_offset = offset;
    }

    pub fn note_offset(&self) -> u64 {
        self.note_offset
    }

    pub fn set_note_offset_absolute(&mut self, offset: u64) {
        self.note_offset_absolute = offset;
    }

    pub fn note_offset_absolute(&self) -> u64 {
        self.note_offset_absolute
    }

    pub fn set_start_note_offset(&mut self, offset: u64) {
        self.start_note_offset = offset;
    }

    pub fn start_note_offset(&self) -> u64 {
        self.start_note_offset
    }

    pub fn tact_counter(&self) -> u64 {
        self.tact_counter
    }

    pub fn delay_counter(&self) -> u32 {
        self.delay_counter
    }

    pub fn tic_counter(&self) -> usize {
        self.tic_counter
    }

    pub fn delay(&self, table: &TimingTable) -> u32 {
        table.delay(self.tic_counter)
    }

    /// Frame at which the current tick started, relative to its first period.
    pub fn attack(&self, table: &TimingTable) -> u32 {
        table.attack(self.tic_counter)
    }

    pub fn next_attack(&self, table: &TimingTable) -> u32 {
        table.attack(self.tic_counter + 1)
    }

    /// Frames from the start of the current period to the next tick boundary.
    pub fn frames_until_tick(&self, table: &TimingTable) -> u64 {
        let remaining = table.delay(self.tic_counter).saturating_sub(self.delay_counter) as u64;
        remaining * table.buffer_size() as u64 + self.next_attack(table) as u64
    }

    /// Position in 1/16 subdivisions of a tick at `frame` of the current period.
    pub fn note_256th_offset(&self, table: &TimingTable, frame: u32) -> u64 {
        let elapsed = (self.delay_counter as u64 * table.buffer_size() as u64 + frame as u64)
            .saturating_sub(self.attack(table) as u64);
        let subdivisions = (table.period_count() * FINE_RESOLUTION) as u64;
        let fine = (elapsed * subdivisions / table.total_frames()).min(FINE_RESOLUTION as u64 - 1);
        self.note_offset * FINE_RESOLUTION as u64 + fine
    }

    pub fn position(&self) -> PositionEvent {
        PositionEvent {
            note_offset: self.note_offset,
            note_offset_absolute: self.note_offset_absolute,
            tic: self.tic_counter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_period_per_tick() -> TimingTable {
        // 44.1 kHz / 1024 frames at 160 bpm and factor 1 corrects to exactly
        // one period per tick.
        TimingTable::compute(44_100, 1_024, 160.0, 1.0).unwrap()
    }

    #[test]
    fn every_period_is_a_tick_when_delay_is_one() {
        let table = one_period_per_tick();
        assert!(table.ticks().iter().all(|tick| tick.delay == 1 && tick.attack == 0));
        let mut transport = TransportState::new();
        for _ in 0..10 {
            assert_eq!(transport.advance_tick(&table), 1);
        }
        assert_eq!(transport.note_offset(), 10);
        assert_eq!(transport.note_offset_absolute(), 10);
        assert_eq!(transport.tic_counter(), 10);
    }

    #[test]
    fn loop_right_is_exclusive() {
        let table = one_period_per_tick();
        let mut transport = TransportState::new();
        transport
            .set_loop(LoopRegion {
                left: 4,
                right: 8,
                enabled: true,
            })
            .unwrap();
        transport.set_note_offset(4);
        let mut seen = Vec::new();
        for _ in 0..9 {
            transport.advance_tick(&table);
            seen.push(transport.note_offset());
        }
        assert_eq!(seen, vec![5, 6, 7, 4, 5, 6, 7, 4, 5]);
        assert_eq!(transport.note_offset_absolute(), 9);
    }

    #[test]
    fn empty_loop_is_rejected() {
        let mut transport = TransportState::new();
        let err = transport
            .set_loop(LoopRegion {
                left: 8,
                right: 8,
                enabled: true,
            })
            .unwrap_err();
        assert_eq!(err, TransportError::InvalidLoop { left: 8, right: 8 });
    }

    #[test]
    fn rewind_returns_to_start_note_offset() {
        let table = one_period_per_tick();
        let mut transport = TransportState::new();
        transport.set_start_note_offset(16);
        transport.apply(TransportCommand::Rewind).unwrap();
        transport.advance_tick(&table);
        assert_eq!(transport.note_offset(), 17);
        transport.apply(TransportCommand::Rewind).unwrap();
        assert_eq!(transport.position().note_offset, 16);
        assert_eq!(transport.tact_counter(), 0);
    }
}
