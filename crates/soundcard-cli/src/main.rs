use std::f32::consts::TAU;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use soundcard_core::io::cpal_backend::CpalHost;
use soundcard_core::io::{
    BackendAdapter, BlockingBackend, CallbackBackend, CaptureBackend, Clock, DeviceEvent, DeviceId,
    NullSink, NullSource, PeriodIo, RawPcmSink, RawPcmSource, RenderOutcome, TimerHost,
};
use soundcard_core::rt::{
    BridgeMode, CallbackBridge, Health, HealthReport, PositionEvent, RingBuffer, RingLayout,
    SampleFormat, TimingTable,
};
use soundcard_core::{LatencyMetrics, PeriodBuffer, Renderer, Soundcard, SoundcardConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Table(args) => execute_table(args),
        Commands::Devices(args) => execute_devices(args),
        Commands::Play(args) => execute_play(args),
        Commands::Record(args) => execute_record(args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Soundcard timing and playback tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the delay/attack table for a tempo as JSON.
    Table(TableArgs),
    /// List the output devices a backend reports.
    Devices(DevicesArgs),
    /// Play a test tone and report the device health.
    Play(PlayArgs),
    /// Capture raw PCM from an input device.
    Record(RecordArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Discards audio, paced like hardware.
    Null,
    /// Blocking writes of raw PCM to a device node or FIFO.
    Raw,
    /// Callback-driven host run from a timer thread.
    Timer,
    /// The platform audio host (needs the `cpal` feature).
    Cpal,
}

#[derive(Clone, Copy, ValueEnum)]
enum CaptureKind {
    /// Delivers silence, paced like hardware.
    Null,
    /// Blocking reads of raw PCM from a device node or FIFO.
    Raw,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    S8,
    S16,
    S24,
    S32,
    S64,
    Float,
    Double,
}

impl From<FormatArg> for SampleFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::S8 => SampleFormat::S8,
            FormatArg::S16 => SampleFormat::S16,
            FormatArg::S24 => SampleFormat::S24,
            FormatArg::S32 => SampleFormat::S32,
            FormatArg::S64 => SampleFormat::S64,
            FormatArg::Float => SampleFormat::Float,
            FormatArg::Double => SampleFormat::Double,
        }
    }
}

/// Settings shared by every subcommand; flags override the config file.
#[derive(Args)]
struct ConfigArgs {
    /// Soundcard configuration (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    samplerate: Option<u32>,
    #[arg(long)]
    buffer_size: Option<usize>,
    #[arg(long)]
    channels: Option<usize>,
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
    #[arg(long)]
    bpm: Option<f64>,
    #[arg(long)]
    delay_factor: Option<f64>,
    /// Segmentation such as `4/4`; takes precedence over `--delay-factor`.
    #[arg(long)]
    segmentation: Option<String>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<SoundcardConfig> {
        let mut config = match &self.config {
            Some(path) => SoundcardConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => SoundcardConfig::default(),
        };
        if let Some(samplerate) = self.samplerate {
            config.presets.samplerate = samplerate;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.presets.buffer_size = buffer_size;
        }
        if let Some(channels) = self.channels {
            config.presets.channels = channels;
        }
        if let Some(format) = self.format {
            config.presets.format = format.into();
        }
        if let Some(bpm) = self.bpm {
            config.bpm = bpm;
        }
        if let Some(delay_factor) = self.delay_factor {
            config = config.with_delay_factor(delay_factor);
        }
        if let Some(segmentation) = &self.segmentation {
            config = config.with_segmentation(segmentation.clone());
        }
        config.validate().context("invalid soundcard configuration")?;
        Ok(config)
    }
}

#[derive(Args)]
struct TableArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Emit compact JSON.
    #[arg(long)]
    compact: bool,
}

#[derive(Args)]
struct DevicesArgs {
    #[arg(long, value_enum, default_value_t = BackendKind::Null)]
    backend: BackendKind,
    /// Device node for the raw backend.
    #[arg(long)]
    device: Option<String>,
    /// Print the channel, samplerate and buffer size ranges of the device.
    #[arg(long)]
    pcm_info: bool,
}

#[derive(Args)]
struct PlayArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long, value_enum, default_value_t = BackendKind::Null)]
    backend: BackendKind,
    /// Output device id; the backend default when omitted.
    #[arg(long)]
    device: Option<String>,
    /// Playback length in seconds.
    #[arg(long, default_value_t = 2.0)]
    seconds: f64,
    /// Test tone frequency in Hz.
    #[arg(long, default_value_t = 440.0)]
    frequency: f32,
    /// Loop the transport over this many ticks.
    #[arg(long)]
    loop_ticks: Option<u64>,
    /// Never wait on the host callback (offline rendering).
    #[arg(long)]
    pass_through: bool,
}

#[derive(Args)]
struct RecordArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long, value_enum, default_value_t = CaptureKind::Null)]
    backend: CaptureKind,
    /// Input device id; the backend default when omitted.
    #[arg(long)]
    device: Option<String>,
    /// Recording length in seconds.
    #[arg(long, default_value_t = 2.0)]
    seconds: f64,
    /// Raw PCM output file; captured audio is discarded when omitted.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn execute_table(args: TableArgs) -> Result<()> {
    let config = args.config.resolve()?;
    let table: TimingTable = config.timing_table()?;
    let json = if args.compact {
        serde_json::to_string(&table)?
    } else {
        serde_json::to_string_pretty(&table)?
    };
    println!("{json}");
    Ok(())
}

fn execute_devices(args: DevicesArgs) -> Result<()> {
    let backend = make_backend(args.backend, args.device.as_deref(), 0);
    let devices = backend.devices().context("failed to enumerate devices")?;
    if devices.is_empty() {
        println!("No output devices reported by the {} backend.", backend.name());
    }
    for device in devices {
        let marker = if device.is_default_output { "*" } else { " " };
        println!("{marker} {:<24} {}", device.id, device.name);
    }
    if args.pcm_info {
        let device = args.device.map(DeviceId::new).unwrap_or_default();
        let capabilities = backend
            .pcm_info(&device)
            .with_context(|| format!("failed to query {device}"))?;
        println!("{}", serde_json::to_string_pretty(&capabilities)?);
    }
    Ok(())
}

fn make_backend(
    kind: BackendKind,
    device: Option<&str>,
    retries: u32,
) -> Box<dyn BackendAdapter> {
    match kind {
        BackendKind::Null => {
            Box::new(BlockingBackend::new(NullSink::new()).with_write_retries(retries))
        }
        BackendKind::Raw => {
            let sink = RawPcmSink::new(device.unwrap_or(RawPcmSink::DEFAULT_PATH));
            Box::new(BlockingBackend::new(sink).with_write_retries(retries))
        }
        BackendKind::Timer => Box::new(CallbackBackend::new(TimerHost::new())),
        BackendKind::Cpal => Box::new(CallbackBackend::new(CpalHost::new())),
    }
}

#[derive(Serialize)]
struct PlayReport {
    backend: &'static str,
    played_for_ms: u128,
    position: PositionEvent,
    uptime_ms: u128,
    latency: LatencyMetrics,
    health: HealthReport,
}

fn execute_play(args: PlayArgs) -> Result<()> {
    if !(args.seconds.is_finite() && args.seconds > 0.0) {
        bail!("--seconds must be positive");
    }
    let mut config = args.config.resolve()?;
    if let Some(device) = &args.device {
        config = config.with_device(device.clone());
    }
    if args.pass_through {
        config = config.with_bridge_mode(BridgeMode::PassThrough);
    }

    let backend = make_backend(args.backend, args.device.as_deref(), config.write_retries);
    let tone = Tone::new(args.frequency);
    let mut card = Soundcard::new(config, backend, tone).context("failed to create soundcard")?;
    if let Some(ticks) = args.loop_ticks {
        card.set_loop(0, ticks, true)
            .context("invalid loop length")?;
    }
    let events = card.events();

    let started = Instant::now();
    card.start().context("failed to start playback")?;
    let deadline = started + Duration::from_secs_f64(args.seconds);
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match events.recv_timeout(deadline - now) {
            Ok(DeviceEvent::DeviceLost(reason)) => {
                tracing::error!(%reason, "output device lost");
                break;
            }
            Ok(event) => tracing::debug!(?event, "device event"),
            Err(_) => thread::sleep(Duration::from_millis(1)),
        }
    }
    card.stop().context("failed to stop playback")?;

    let report = PlayReport {
        backend: card.backend().name(),
        played_for_ms: started.elapsed().as_millis(),
        position: card.position(),
        uptime_ms: card.uptime().as_millis(),
        latency: card.latency(),
        health: card.health(),
    };
    card.close().context("failed to close the device")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.health.device_lost {
        bail!("the output device was lost during playback");
    }
    Ok(())
}

#[derive(Serialize)]
struct RecordReport {
    backend: &'static str,
    recorded_for_ms: u128,
    periods: u64,
    bytes: u64,
    position: PositionEvent,
    health: HealthReport,
}

fn execute_record(args: RecordArgs) -> Result<()> {
    if !(args.seconds.is_finite() && args.seconds > 0.0) {
        bail!("--seconds must be positive");
    }
    let config = args.config.resolve()?;
    let presets = config.presets;
    let layout = RingLayout::new(config.ring_slots, presets, config.sub_block_count);
    let clock = Clock::new(
        config.timing_table()?,
        config.position_queue_capacity,
        config.transport_queue_capacity,
    );
    let io = PeriodIo::new(
        Arc::new(RingBuffer::new(layout)?),
        Arc::new(clock),
        Arc::new(CallbackBridge::new(config.bridge_mode)),
        Arc::new(Health::new()),
    );

    let retries = config.write_retries;
    let mut backend: Box<dyn BackendAdapter> = match args.backend {
        CaptureKind::Null => {
            Box::new(CaptureBackend::new(NullSource::new()).with_read_retries(retries))
        }
        CaptureKind::Raw => {
            Box::new(CaptureBackend::new(RawPcmSource::default()).with_read_retries(retries))
        }
    };
    let device = args.device.map(DeviceId::new).unwrap_or_default();
    backend
        .open(&device, &presets, io.clone())
        .context("failed to open the capture device")?;
    let mut output = match &args.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => None,
    };

    let mut totals = Totals::default();
    let started = Instant::now();
    backend.start().context("failed to start capture")?;
    let deadline = started + Duration::from_secs_f64(args.seconds);
    while Instant::now() < deadline && !io.health().is_device_lost() {
        if receive_into(&io, io.period(), &mut output, &mut totals)? == RenderOutcome::Shutdown {
            break;
        }
    }
    let recorded_for_ms = started.elapsed().as_millis();
    backend.close().context("failed to close the capture device")?;
    // Periods captured before close are still queued in the ring.
    loop {
        let outcome = receive_into(&io, Duration::ZERO, &mut output, &mut totals)?;
        if outcome != RenderOutcome::Committed {
            break;
        }
    }
    if let Some(mut output) = output {
        output.flush().context("failed to flush captured audio")?;
    }

    let report = RecordReport {
        backend: backend.name(),
        recorded_for_ms,
        periods: totals.periods,
        bytes: totals.bytes,
        position: io.clock().snapshot().position(),
        health: io.health().report(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.health.device_lost {
        bail!("the input device was lost during capture");
    }
    Ok(())
}

#[derive(Default)]
struct Totals {
    periods: u64,
    bytes: u64,
}

fn receive_into(
    io: &PeriodIo,
    timeout: Duration,
    output: &mut Option<BufWriter<File>>,
    totals: &mut Totals,
) -> Result<RenderOutcome> {
    let mut period = Vec::new();
    let outcome = io.receive(timeout, |slot| period.extend_from_slice(slot.bytes()))?;
    if let Some(output) = output {
        output
            .write_all(&period)
            .context("failed to write captured audio")?;
    }
    if outcome == RenderOutcome::Committed {
        totals.periods += 1;
        totals.bytes += period.len() as u64;
    }
    Ok(outcome)
}

/// Sine test tone with a short accent on every tick.
struct Tone {
    frequency: f32,
    phase: f32,
    ticks: u64,
}

impl Tone {
    const GAIN: f32 = 0.2;
    const ACCENT: f32 = 0.5;

    fn new(frequency: f32) -> Self {
        Self {
            frequency,
            phase: 0.0,
            ticks: 0,
        }
    }
}

impl Renderer for Tone {
    fn render_period(&mut self, buffer: &mut PeriodBuffer<'_, '_>) {
        let step = TAU * self.frequency / buffer.samplerate() as f32;
        // Accent the tick that starts inside this period.
        let accent = (buffer.transport().delay_counter() == 0).then(|| buffer.attack() as usize);
        let accent_frames = buffer.frames() / 8;
        for frame in 0..buffer.frames() {
            let mut gain = Self::GAIN;
            if let Some(attack) = accent {
                if (attack..attack + accent_frames).contains(&frame) {
                    gain = Self::ACCENT;
                }
            }
            let sample = self.phase.sin() * gain;
            for channel in 0..buffer.channels() {
                buffer.write_sample(frame, channel, sample);
            }
            self.phase = (self.phase + step) % TAU;
        }
    }

    fn position_changed(&mut self, position: PositionEvent) {
        self.ticks += 1;
        tracing::trace!(
            note_offset = position.note_offset,
            absolute = position.note_offset_absolute,
            ticks = self.ticks,
            "position"
        );
    }
}
