//! The per-period exchange shared by the render producer and a backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, MutexGuard};
use soundcard_rt::{
    BridgeMode, CallbackBridge, EventQueue, Health, PositionEvent, Presets, QueueError, ReadSlot,
    RingBuffer, RingError, TimingTable, TransportCommand, TransportState, Wake, WriteSlot,
};

use crate::{BackendError, Driving, Result};

/// Result of handing one period to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOutcome {
    /// A committed slot was played and the transport crossed `ticks` boundaries.
    Played { ticks: u32 },
    /// A capture device committed one period to the ring.
    Captured { ticks: u32 },
    /// A capture device found every slot pending and discarded its period.
    Overrun { ticks: u32 },
    /// No slot was ready; silence was played and the transport held still.
    Silence,
    /// The ring was closed and drained, or the bridge shut down.
    Shutdown,
}

/// Result of one producer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Committed,
    /// No slot could be acquired in time; the period was never rendered.
    Dropped,
    Shutdown,
}

/// Terminal conditions reported by backend threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Started,
    Stopped,
    DeviceLost(String),
}

/// Timing table and transport advanced by the consuming side.
///
/// The table is swapped atomically on tempo changes; the transport is only
/// locked for the tick itself and by the control surface. Commands scheduled
/// from other threads are applied right before the next tick.
#[derive(Debug)]
pub struct Clock {
    table: ArcSwap<TimingTable>,
    transport: Mutex<TransportState>,
    positions: EventQueue<PositionEvent>,
    commands: EventQueue<TransportCommand>,
}

impl Clock {
    pub fn new(table: TimingTable, position_capacity: usize, command_capacity: usize) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            transport: Mutex::new(TransportState::new()),
            positions: EventQueue::new(position_capacity),
            commands: EventQueue::new(command_capacity),
        }
    }

    /// Queues `command` for the consuming thread without taking any lock.
    pub fn schedule(&self, command: TransportCommand) -> std::result::Result<(), QueueError> {
        self.commands.try_push(command)
    }

    pub fn table(&self) -> Arc<TimingTable> {
        self.table.load_full()
    }

    pub fn set_table(&self, table: TimingTable) {
        self.table.store(Arc::new(table));
    }

    pub fn transport(&self) -> MutexGuard<'_, TransportState> {
        self.transport.lock()
    }

    pub fn snapshot(&self) -> TransportState {
        self.transport.lock().clone()
    }

    pub fn positions(&self) -> &EventQueue<PositionEvent> {
        &self.positions
    }

    /// Advances the transport by one consumed period.
    ///
    /// A position event is published whenever a tick boundary was crossed.
    pub fn tick(&self, health: &Health) -> u32 {
        let table = self.table.load();
        let mut transport = self.transport.lock();
        while let Ok(command) = self.commands.try_pop() {
            if let Err(err) = transport.apply(command) {
                tracing::warn!(%err, ?command, "dropping scheduled transport command");
            }
        }
        let crossed = transport.advance_tick(&table);
        if crossed > 0 && !self.positions.publish(transport.position()) {
            health.record_dropped_position();
        }
        crossed
    }
}

/// Handles a backend and the render producer share for one open device.
#[derive(Debug, Clone)]
pub struct PeriodIo {
    ring: Arc<RingBuffer>,
    clock: Arc<Clock>,
    bridge: Arc<CallbackBridge>,
    health: Arc<Health>,
    events: Option<Sender<DeviceEvent>>,
    silence: Arc<[u8]>,
}

impl PeriodIo {
    pub fn new(
        ring: Arc<RingBuffer>,
        clock: Arc<Clock>,
        bridge: Arc<CallbackBridge>,
        health: Arc<Health>,
    ) -> Self {
        let silence = vec![0u8; ring.layout().presets.period_bytes()].into();
        Self {
            ring,
            clock,
            bridge,
            health,
            events: None,
            silence,
        }
    }

    pub fn with_events(mut self, events: Sender<DeviceEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn presets(&self) -> &Presets {
        &self.ring.layout().presets
    }

    pub fn period(&self) -> Duration {
        self.presets().period_duration()
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn bridge(&self) -> &Arc<CallbackBridge> {
        &self.bridge
    }

    pub fn health(&self) -> &Arc<Health> {
        &self.health
    }

    pub fn notify(&self, event: DeviceEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                tracing::debug!("device event dropped, no listener");
            }
        }
    }

    /// Producer side: fills and commits the next writable slot.
    ///
    /// Self-driven backends let the producer block on ring space. For
    /// callback-driven backends the producer first waits for the host to ask
    /// for a buffer and gives up on a full ring after one period; in
    /// pass-through mode it never waits at all.
    pub fn produce<F>(&self, driving: Driving, render: F) -> Result<RenderOutcome>
    where
        F: FnOnce(&mut WriteSlot<'_>),
    {
        match driving {
            Driving::SelfDriven => self.fill(self.ring.acquire_write(), render),
            Driving::Callback if self.bridge.mode() == BridgeMode::PassThrough => {
                self.fill(self.ring.try_acquire_write(), render)
            }
            Driving::Callback => {
                if self.bridge.wait_for_request() == Wake::Shutdown {
                    return Ok(RenderOutcome::Shutdown);
                }
                let outcome = self.fill(self.ring.acquire_write_timeout(self.period()), render);
                self.bridge.finish();
                outcome
            }
        }
    }

    fn fill<F>(
        &self,
        acquired: std::result::Result<WriteSlot<'_>, RingError>,
        render: F,
    ) -> Result<RenderOutcome>
    where
        F: FnOnce(&mut WriteSlot<'_>),
    {
        let mut slot = match acquired {
            Ok(slot) => slot,
            Err(RingError::Closed) => return Ok(RenderOutcome::Shutdown),
            Err(RingError::WouldOverrun { .. }) => {
                self.health.record_overrun();
                return Ok(RenderOutcome::Dropped);
            }
            Err(err) => return Err(err.into()),
        };
        let started = Instant::now();
        render(&mut slot);
        slot.commit()?;
        self.health.record_render(started.elapsed(), self.period());
        Ok(RenderOutcome::Committed)
    }

    /// Self-driven consumer: plays the next slot through `write`.
    ///
    /// Waits at most `timeout` for the producer; when nothing arrives the
    /// period is played as silence and counted as an underrun. A failed
    /// `write` leaves the slot in the ring.
    pub fn consume<W>(&self, timeout: Duration, write: W) -> Result<PeriodOutcome>
    where
        W: FnOnce(&[u8]) -> Result<()>,
    {
        match self.ring.acquire_read_timeout(timeout) {
            Ok(slot) => {
                write(slot.bytes())?;
                Ok(self.complete(slot))
            }
            Err(RingError::WouldUnderrun) => {
                write(&self.silence)?;
                self.health.record_underrun();
                Ok(PeriodOutcome::Silence)
            }
            Err(RingError::Closed) => Ok(PeriodOutcome::Shutdown),
            Err(err) => Err(err.into()),
        }
    }

    /// Plays whatever is still committed, without waiting or padding silence.
    pub fn drain<W>(&self, mut write: W) -> Result<usize>
    where
        W: FnMut(&[u8]) -> Result<()>,
    {
        let mut played = 0;
        loop {
            match self.ring.try_acquire_read() {
                Ok(slot) => {
                    write(slot.bytes())?;
                    self.complete(slot);
                    played += 1;
                }
                Err(RingError::WouldUnderrun) | Err(RingError::Closed) => return Ok(played),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Capture side: reads the next period from the device into the ring.
    ///
    /// Waits at most `timeout` for the graph to free a slot. When none frees
    /// up the period is still read, into `scratch`, and counted as an
    /// overrun so the device keeps its pace. The transport ticks for every
    /// period read. A failed `read` commits nothing.
    pub fn capture<R>(
        &self,
        timeout: Duration,
        scratch: &mut [u8],
        mut read: R,
    ) -> Result<PeriodOutcome>
    where
        R: FnMut(&mut [u8]) -> Result<()>,
    {
        match self.ring.acquire_write_timeout(timeout) {
            Ok(mut slot) => {
                read(slot.bytes_mut())?;
                slot.commit()?;
                self.health.record_captured();
                let ticks = self.clock.tick(&self.health);
                Ok(PeriodOutcome::Captured { ticks })
            }
            Err(RingError::WouldOverrun { .. }) => {
                read(scratch)?;
                self.health.record_overrun();
                let ticks = self.clock.tick(&self.health);
                Ok(PeriodOutcome::Overrun { ticks })
            }
            Err(RingError::Closed) => Ok(PeriodOutcome::Shutdown),
            Err(err) => Err(err.into()),
        }
    }

    /// Graph side of a capture device: hands the oldest captured period to
    /// `take` and frees its slot.
    ///
    /// Captured periods are still handed out after the ring was closed,
    /// until it runs empty.
    pub fn receive<F>(&self, timeout: Duration, take: F) -> Result<RenderOutcome>
    where
        F: FnOnce(&ReadSlot<'_>),
    {
        match self.ring.acquire_read_timeout(timeout) {
            Ok(slot) => {
                take(&slot);
                slot.commit();
                Ok(RenderOutcome::Committed)
            }
            Err(RingError::WouldUnderrun) => Ok(RenderOutcome::Dropped),
            Err(RingError::Closed) => Ok(RenderOutcome::Shutdown),
            Err(err) => Err(err.into()),
        }
    }

    /// Callback-driven consumer, called on the host's thread.
    ///
    /// `output` receives the slot to copy from, or `None` when the host
    /// callback must play silence. Never fails: the host boundary cannot
    /// carry errors.
    pub fn host_period<F>(&self, output: F) -> PeriodOutcome
    where
        F: FnOnce(Option<&ReadSlot<'_>>),
    {
        self.bridge.request();
        let wake = self.bridge.wait_for_finish();
        if wake == Wake::Shutdown {
            output(None);
            return PeriodOutcome::Shutdown;
        }
        match self.ring.try_acquire_read() {
            Ok(slot) => {
                output(Some(&slot));
                self.complete(slot)
            }
            Err(RingError::Closed) => {
                output(None);
                PeriodOutcome::Shutdown
            }
            Err(_) => {
                output(None);
                if wake != Wake::Initial {
                    self.health.record_underrun();
                }
                PeriodOutcome::Silence
            }
        }
    }

    fn complete(&self, slot: ReadSlot<'_>) -> PeriodOutcome {
        slot.commit();
        self.health.record_played();
        let ticks = self.clock.tick(&self.health);
        PeriodOutcome::Played { ticks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundcard_rt::{RingLayout, SampleFormat};

    fn io(mode: BridgeMode) -> PeriodIo {
        let presets = Presets::new(1, 44_100, 1_024, SampleFormat::S16);
        let ring = RingBuffer::new(RingLayout::new(4, presets, 2)).unwrap();
        let table = TimingTable::compute(44_100, 1_024, 160.0, 1.0).unwrap();
        PeriodIo::new(
            Arc::new(ring),
            Arc::new(Clock::new(table, 4, 4)),
            Arc::new(CallbackBridge::new(mode)),
            Arc::new(Health::new()),
        )
    }

    #[test]
    fn underrun_plays_silence_without_ticking() {
        let io = io(BridgeMode::Blocking);
        let mut written = Vec::new();
        let outcome = io
            .consume(Duration::from_millis(1), |bytes| {
                written.extend_from_slice(bytes);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, PeriodOutcome::Silence);
        assert_eq!(written.len(), 2_048);
        assert!(written.iter().all(|byte| *byte == 0));
        assert_eq!(io.health().underruns(), 1);
        assert_eq!(io.clock().snapshot().note_offset_absolute(), 0);
    }

    #[test]
    fn played_period_ticks_and_publishes_position() {
        let io = io(BridgeMode::Blocking);
        let outcome = io
            .produce(Driving::SelfDriven, |slot| slot.write_sample(0, 0, 0.5))
            .unwrap();
        assert_eq!(outcome, RenderOutcome::Committed);

        let outcome = io.consume(Duration::from_millis(1), |_| Ok(())).unwrap();
        assert_eq!(outcome, PeriodOutcome::Played { ticks: 1 });
        let event = io.clock().positions().try_pop().unwrap();
        assert_eq!(event.note_offset_absolute, 1);
    }

    #[test]
    fn scheduled_commands_apply_before_the_next_tick() {
        let io = io(BridgeMode::Blocking);
        io.clock()
            .schedule(TransportCommand::SetNoteOffset(32))
            .unwrap();
        assert_eq!(io.clock().snapshot().note_offset(), 0);
        io.clock().tick(io.health());
        assert_eq!(io.clock().snapshot().note_offset(), 33);
    }

    #[test]
    fn failed_write_keeps_the_slot() {
        let io = io(BridgeMode::Blocking);
        io.produce(Driving::SelfDriven, |_| {}).unwrap();
        let err = io
            .consume(Duration::from_millis(1), |_| {
                Err(BackendError::DeviceLost("unplugged".into()))
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::DeviceLost(_)));
        assert_eq!(io.ring().pending(), 1);
        assert_eq!(io.clock().snapshot().tact_counter(), 0);
    }

    #[test]
    fn pass_through_producer_drops_on_a_full_ring() {
        let io = io(BridgeMode::PassThrough);
        for _ in 0..4 {
            assert_eq!(
                io.produce(Driving::Callback, |_| {}).unwrap(),
                RenderOutcome::Committed
            );
        }
        assert_eq!(
            io.produce(Driving::Callback, |_| {}).unwrap(),
            RenderOutcome::Dropped
        );
        assert_eq!(io.health().overruns(), 1);
        assert_eq!(io.drain(|_| Ok(())).unwrap(), 4);
    }

    #[test]
    fn full_ring_discards_the_captured_period_but_ticks() {
        let io = io(BridgeMode::Blocking);
        let mut scratch = vec![0u8; io.presets().period_bytes()];
        for _ in 0..4 {
            let outcome = io
                .capture(Duration::from_millis(1), &mut scratch, |bytes| {
                    bytes.fill(0x11);
                    Ok(())
                })
                .unwrap();
            assert_eq!(outcome, PeriodOutcome::Captured { ticks: 1 });
        }
        let outcome = io
            .capture(Duration::from_millis(1), &mut scratch, |bytes| {
                bytes.fill(0x22);
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, PeriodOutcome::Overrun { ticks: 1 });
        assert!(scratch.iter().all(|byte| *byte == 0x22));
        assert_eq!(io.health().overruns(), 1);
        assert_eq!(io.health().report().periods_captured, 4);
        assert_eq!(io.clock().snapshot().note_offset_absolute(), 5);

        let mut first = Vec::new();
        let outcome = io
            .receive(Duration::from_millis(1), |slot| first.extend_from_slice(slot.bytes()))
            .unwrap();
        assert_eq!(outcome, RenderOutcome::Committed);
        assert!(first.iter().all(|byte| *byte == 0x11));
        assert_eq!(io.ring().pending(), 3);
    }

    #[test]
    fn failed_read_commits_nothing() {
        let io = io(BridgeMode::Blocking);
        let mut scratch = vec![0u8; io.presets().period_bytes()];
        let err = io
            .capture(Duration::from_millis(1), &mut scratch, |_| {
                Err(BackendError::DeviceLost("unplugged".into()))
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::DeviceLost(_)));
        assert_eq!(io.ring().pending(), 0);
        assert_eq!(io.clock().snapshot().tact_counter(), 0);
        assert_eq!(
            io.receive(Duration::from_millis(1), |_| {}).unwrap(),
            RenderOutcome::Dropped
        );
    }
}
