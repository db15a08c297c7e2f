use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use soundcard_io::{
    BackendAdapter, Clock, DeviceCapabilities, DeviceEvent, DeviceId, DeviceInfo, Direction,
    Driving, PeriodIo, RenderOutcome,
};
use soundcard_rt::{
    BridgeMode, CallbackBridge, Health, HealthReport, LoopRegion, PositionEvent, Presets,
    RingBuffer, RingLayout, TimingTable, TransportCommand, TransportError, TransportState,
};

use crate::config::SoundcardConfig;
use crate::error::{ConfigError, Result, SoundcardError};
use crate::latency::LatencyMetrics;
use crate::renderer::{PeriodBuffer, Renderer};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Running,
}

struct Producer {
    running: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn Renderer>>,
}

/// A soundcard device: one backend, one ring and the render producer feeding it.
///
/// The timing table and transport live for as long as the device does and
/// survive reopening with new presets.
pub struct Soundcard<B: BackendAdapter> {
    config: SoundcardConfig,
    backend: B,
    clock: Arc<Clock>,
    health: Arc<Health>,
    io: Option<PeriodIo>,
    renderer: Option<Box<dyn Renderer>>,
    producer: Option<Producer>,
    events: (Sender<DeviceEvent>, Receiver<DeviceEvent>),
}

impl<B: BackendAdapter> Soundcard<B> {
    /// Fails for capture backends; their periods are drained through
    /// [`PeriodIo::receive`], not rendered.
    pub fn new(config: SoundcardConfig, backend: B, renderer: impl Renderer) -> Result<Self> {
        if backend.direction() == Direction::Capture {
            return Err(SoundcardError::State("capture backend cannot be rendered to"));
        }
        config.validate()?;
        let table = config.timing_table()?;
        let clock = Clock::new(
            table,
            config.position_queue_capacity,
            config.transport_queue_capacity,
        );
        Ok(Self {
            config,
            backend,
            clock: Arc::new(clock),
            health: Arc::new(Health::new()),
            io: None,
            renderer: Some(Box::new(renderer)),
            producer: None,
            events: crossbeam_channel::bounded(EVENT_CAPACITY),
        })
    }

    pub fn config(&self) -> &SoundcardConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> DeviceState {
        if self.producer.is_some() {
            DeviceState::Running
        } else if self.io.is_some() {
            DeviceState::Open
        } else {
            DeviceState::Closed
        }
    }

    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.backend.devices()?)
    }

    /// Ranges the configured device accepts.
    pub fn pcm_info(&self) -> Result<DeviceCapabilities> {
        Ok(self.backend.pcm_info(&self.device_id())?)
    }

    fn device_id(&self) -> DeviceId {
        self.config
            .device
            .clone()
            .map(DeviceId::new)
            .unwrap_or_default()
    }

    /// Terminal conditions reported by the device threads.
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.events.1.clone()
    }

    /// Allocates the ring and opens the backend with the configured presets.
    pub fn open(&mut self) -> Result<()> {
        if self.io.is_some() {
            return Err(SoundcardError::State("already open"));
        }
        let presets = self.config.presets;
        let layout = RingLayout::new(self.config.ring_slots, presets, self.config.sub_block_count);
        let ring = Arc::new(RingBuffer::new(layout)?);
        let bridge = Arc::new(CallbackBridge::new(self.config.bridge_mode));
        let io = PeriodIo::new(
            ring,
            Arc::clone(&self.clock),
            bridge,
            Arc::clone(&self.health),
        )
        .with_events(self.events.0.clone());

        let device = self.device_id();
        self.backend.open(&device, &presets, io.clone())?;
        tracing::info!(
            backend = self.backend.name(),
            %device,
            slots = self.config.ring_slots,
            bpm = self.config.bpm,
            "soundcard opened"
        );
        self.io = Some(io);
        Ok(())
    }

    /// Rewinds the transport to the start note offset and starts playback,
    /// opening the device first when needed.
    pub fn start(&mut self) -> Result<()> {
        match self.state() {
            DeviceState::Running => return Err(SoundcardError::State("already running")),
            DeviceState::Closed => self.open()?,
            DeviceState::Open => {}
        }
        self.clock.transport().rewind();
        self.resume()
    }

    /// Drains what was rendered and pauses both threads.
    pub fn stop(&mut self) -> Result<()> {
        if self.producer.is_none() {
            return Ok(());
        }
        self.quiesce()?;
        tracing::info!(backend = self.backend.name(), "soundcard stopped");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.stop()?;
        if self.io.take().is_some() {
            self.backend.close()?;
            tracing::info!(backend = self.backend.name(), "soundcard closed");
        }
        Ok(())
    }

    /// Plays exactly one period on the calling thread.
    ///
    /// Only valid while open and not running. A callback-driven device can
    /// only be stepped through a pass-through bridge.
    pub fn run_period(&mut self) -> Result<soundcard_io::PeriodOutcome> {
        if self.producer.is_some() {
            return Err(SoundcardError::State("running"));
        }
        let io = self.io.clone().ok_or(SoundcardError::State("closed"))?;
        let driving = self.backend.driving();
        if driving == Driving::Callback && io.bridge().mode() == BridgeMode::Blocking {
            return Err(SoundcardError::State("driven by its host"));
        }
        if io.ring().pending() < io.ring().capacity() {
            let renderer = self
                .renderer
                .as_mut()
                .ok_or_else(|| SoundcardError::Thread("renderer lost".into()))?;
            render_once(&io, driving, &mut **renderer)?;
        }
        let outcome = self.backend.run_period()?;
        if let Some(renderer) = self.renderer.as_mut() {
            forward_positions(&self.clock, &mut **renderer);
        }
        Ok(outcome)
    }

    pub fn get_presets(&self) -> Presets {
        self.config.presets
    }

    /// Reopens the device with `presets`, resuming playback if it was running.
    ///
    /// Nothing changes when the new presets are invalid. When the backend
    /// refuses them on reopen, the previous presets are restored and the
    /// device is brought back to its previous state before the refusal is
    /// returned.
    pub fn set_presets(&mut self, presets: Presets) -> Result<()> {
        let config = self.config.clone().with_presets(presets);
        config.validate()?;
        let table = config.timing_table()?;

        let was = self.state();
        if was == DeviceState::Running {
            self.quiesce()?;
        }
        if self.io.take().is_some() {
            self.backend.close()?;
        }
        let previous = std::mem::replace(&mut self.config, config);
        let previous_table = self.clock.table();
        self.clock.set_table(table);

        if let Err(err) = self.reopen(was) {
            tracing::warn!(%err, "backend refused new presets, restoring previous ones");
            self.config = previous;
            self.clock.set_table((*previous_table).clone());
            if let Err(restore) = self.reopen(was) {
                tracing::error!(%restore, "soundcard could not be reopened");
            }
            return Err(err);
        }
        tracing::info!(
            channels = presets.channels,
            samplerate = presets.samplerate,
            buffer_size = presets.buffer_size,
            format = ?presets.format,
            "soundcard presets changed"
        );
        Ok(())
    }

    /// Brings a closed device back to `state`, closing it again on failure.
    fn reopen(&mut self, state: DeviceState) -> Result<()> {
        let reopened = match state {
            DeviceState::Closed => return Ok(()),
            DeviceState::Open => self.open(),
            DeviceState::Running => self.open().and_then(|()| self.resume()),
        };
        if reopened.is_err() && self.io.take().is_some() {
            if let Err(err) = self.backend.close() {
                tracing::warn!(%err, "backend did not close cleanly");
            }
        }
        reopened
    }

    pub fn bpm(&self) -> f64 {
        self.config.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        self.retime(self.config.clone().with_bpm(bpm))
    }

    pub fn delay_factor(&self) -> Result<f64> {
        Ok(self.config.effective_delay_factor()?)
    }

    pub fn set_delay_factor(&mut self, delay_factor: f64) -> Result<()> {
        self.retime(self.config.clone().with_delay_factor(delay_factor))
    }

    /// Sets the delay factor from an `"n/m"` segmentation.
    pub fn set_segmentation(&mut self, segmentation: &str) -> Result<()> {
        self.retime(self.config.clone().with_segmentation(segmentation))
    }

    pub fn table(&self) -> Arc<TimingTable> {
        self.clock.table()
    }

    pub fn transport(&self) -> TransportState {
        self.clock.snapshot()
    }

    pub fn position(&self) -> PositionEvent {
        self.clock.snapshot().position()
    }

    pub fn note_offset(&self) -> u64 {
        self.clock.snapshot().note_offset()
    }

    pub fn set_note_offset(&self, offset: u64) -> Result<()> {
        self.command(TransportCommand::SetNoteOffset(offset))
    }

    pub fn note_offset_absolute(&self) -> u64 {
        self.clock.snapshot().note_offset_absolute()
    }

    pub fn set_note_offset_absolute(&self, offset: u64) -> Result<()> {
        self.command(TransportCommand::SetNoteOffsetAbsolute(offset))
    }

    pub fn start_note_offset(&self) -> u64 {
        self.clock.snapshot().start_note_offset()
    }

    pub fn set_start_note_offset(&self, offset: u64) -> Result<()> {
        self.command(TransportCommand::SetStartNoteOffset(offset))
    }

    pub fn loop_region(&self) -> LoopRegion {
        self.clock.snapshot().loop_region()
    }

    pub fn set_loop(&self, left: u64, right: u64, enabled: bool) -> Result<()> {
        if enabled && left >= right {
            return Err(TransportError::InvalidLoop { left, right }.into());
        }
        self.command(TransportCommand::SetLoop(LoopRegion {
            left,
            right,
            enabled,
        }))
    }

    /// Applies `command` now, or before the next tick while running.
    pub fn schedule_transport(&self, command: TransportCommand) -> Result<()> {
        self.command(command)
    }

    /// Musical time played since the transport was last rewound.
    pub fn uptime(&self) -> Duration {
        self.clock.table().uptime(self.note_offset_absolute())
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn reset_health(&self) {
        self.health.reset();
    }

    pub fn latency(&self) -> LatencyMetrics {
        LatencyMetrics::new(
            self.config.presets.samplerate,
            self.config.presets.buffer_size,
            self.config.ring_slots,
        )
    }

    fn command(&self, command: TransportCommand) -> Result<()> {
        if self.producer.is_some() {
            return self
                .clock
                .schedule(command)
                .map_err(|_| SoundcardError::TransportQueueFull);
        }
        self.clock
            .transport()
            .apply(command)
            .map_err(|err| SoundcardError::Configuration(ConfigError::Transport(err)))
    }

    /// Swaps in a table for `config`; the consumer picks it up at its next tick.
    fn retime(&mut self, config: SoundcardConfig) -> Result<()> {
        let table = config.timing_table()?;
        tracing::debug!(
            bpm = table.bpm(),
            delay_factor = table.delay_factor(),
            "timing table recomputed"
        );
        self.clock.set_table(table);
        self.config = config;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let io = self.io.clone().ok_or(SoundcardError::State("closed"))?;
        let renderer = self
            .renderer
            .take()
            .ok_or_else(|| SoundcardError::Thread("renderer lost".into()))?;
        let driving = self.backend.driving();
        // Rearm before the producer can observe a previous shutdown.
        if io.bridge().is_shutdown() {
            io.bridge().reset();
        }
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = Arc::clone(&running);
        let thread_io = io.clone();
        let handle = thread::Builder::new()
            .name("soundcard-render".into())
            .spawn(move || produce(thread_io, driving, thread_running, renderer))
            .map_err(|err| {
                SoundcardError::Thread(format!("failed to spawn render thread: {err}"))
            })?;
        self.producer = Some(Producer { running, handle });

        if let Err(err) = self.backend.start() {
            tracing::error!(%err, "backend failed to start");
            if let Err(quiesce) = self.quiesce() {
                tracing::warn!(%quiesce, "render thread did not stop cleanly");
            }
            return Err(err.into());
        }
        tracing::info!(backend = self.backend.name(), ?driving, "soundcard running");
        Ok(())
    }

    /// Pauses the producer and the backend and empties the ring.
    ///
    /// A self-driven backend plays out what was already rendered first; a
    /// host callback cannot be kept waiting, so pending periods are dropped.
    fn quiesce(&mut self) -> Result<()> {
        let Some(producer) = self.producer.take() else {
            return Ok(());
        };
        producer.running.store(false, Ordering::Release);
        let io = self.io.clone().ok_or(SoundcardError::State("closed"))?;
        let ring = Arc::clone(io.ring());

        let stopped = match self.backend.driving() {
            Driving::SelfDriven => {
                let budget = io.period() * (ring.capacity() as u32 + 2);
                if !ring.wait_drained(budget) {
                    tracing::warn!(pending = ring.pending(), "ring not drained before stop");
                }
                ring.close();
                self.backend.stop()
            }
            Driving::Callback => {
                let stopped = self.backend.stop();
                io.bridge().shutdown();
                ring.close();
                stopped
            }
        };

        match producer.handle.join() {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(err) => {
                tracing::error!(?err, "failed to join soundcard render thread");
                return Err(SoundcardError::Thread("render thread panicked".into()));
            }
        }
        stopped?;
        ring.reset()?;
        if let Some(renderer) = self.renderer.as_mut() {
            forward_positions(&self.clock, &mut **renderer);
        }
        Ok(())
    }
}

impl<B: BackendAdapter> Drop for Soundcard<B> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(%err, "soundcard did not close cleanly");
        }
    }
}

fn render_once(
    io: &PeriodIo,
    driving: Driving,
    renderer: &mut dyn Renderer,
) -> Result<RenderOutcome> {
    let table = io.clock().table();
    let transport = io.clock().snapshot();
    let outcome = io.produce(driving, |slot| {
        let mut buffer = PeriodBuffer::new(slot, &transport, &table);
        renderer.render_period(&mut buffer);
    })?;
    Ok(outcome)
}

fn forward_positions(clock: &Clock, renderer: &mut dyn Renderer) {
    while let Ok(position) = clock.positions().try_pop() {
        renderer.position_changed(position);
    }
}

fn produce(
    io: PeriodIo,
    driving: Driving,
    running: Arc<AtomicBool>,
    mut renderer: Box<dyn Renderer>,
) -> Box<dyn Renderer> {
    tracing::debug!(?driving, "render thread started");
    let backoff = io.period() / 2;
    while running.load(Ordering::Acquire) {
        let outcome = render_once(&io, driving, &mut *renderer);
        forward_positions(io.clock(), &mut *renderer);
        match outcome {
            Ok(RenderOutcome::Committed) => {}
            Ok(RenderOutcome::Dropped) => thread::sleep(backoff),
            Ok(RenderOutcome::Shutdown) => break,
            Err(err) => {
                tracing::warn!(%err, "render period failed");
                thread::sleep(backoff);
            }
        }
    }
    tracing::debug!("render thread stopped");
    renderer
}
