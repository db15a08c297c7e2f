//! Backend adapters move finished periods from the ring to audio hardware.
//!
//! Two driving models exist. Self-driven backends own a thread issuing
//! blocking native writes ([`blocking::BlockingBackend`]). Callback-driven
//! backends are called by a thread the native framework owns and meet the
//! render producer through the [`soundcard_rt::CallbackBridge`]
//! ([`callback::CallbackBackend`]).
//!
//! Capture runs the ring the other way round: [`capture::CaptureBackend`]
//! reads periods from the device into the ring and the graph drains them.

use std::fmt;

use soundcard_rt::{format, Presets, RingError};
use thiserror::Error;

pub mod blocking;
pub mod callback;
pub mod capture;
pub mod period;
pub mod sinks;
pub mod sources;

#[cfg(feature = "cpal")]
pub mod cpal_backend;

#[cfg(not(feature = "cpal"))]
pub mod cpal_backend {
    use super::*;
    use crate::callback::{CallbackBackend, CallbackHost, HostCallback};

    pub type CpalBackend = CallbackBackend<CpalHost>;

    #[derive(Default, Clone)]
    pub struct CpalHost;

    impl CpalHost {
        pub fn new() -> Self {
            Self
        }
    }

    impl CallbackHost for CpalHost {
        fn name(&self) -> &'static str {
            "cpal (stub)"
        }

        fn devices(&self) -> Result<Vec<DeviceInfo>> {
            Ok(Vec::new())
        }

        fn default_device(&self) -> Result<DeviceId> {
            Err(BackendError::Backend(
                "cpal backend not available in this build".into(),
            ))
        }

        fn open(
            &mut self,
            _device: &DeviceId,
            _presets: &Presets,
            _callback: HostCallback,
        ) -> Result<()> {
            Err(BackendError::Backend(
                "cpal backend not available in this build".into(),
            ))
        }

        fn start(&mut self) -> Result<()> {
            Err(BackendError::NotOpen)
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }
}

pub use blocking::BlockingBackend;
pub use callback::{CallbackBackend, CallbackHost, HostCallback, TimerHost};
pub use capture::CaptureBackend;
pub use period::{Clock, DeviceEvent, PeriodIo, PeriodOutcome, RenderOutcome};
pub use sinks::{NullSink, PcmSink, RawPcmSink};
pub use sources::{NullSource, PcmSource, RawPcmSource};

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// An empty id selects the backend's default device.
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<default>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub is_default_output: bool,
}

/// Parameter ranges a card reports for one device, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceCapabilities {
    pub min_channels: usize,
    pub max_channels: usize,
    pub min_samplerate: u32,
    pub max_samplerate: u32,
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
}

impl Default for DeviceCapabilities {
    /// Everything [`Presets::validate`] accepts.
    fn default() -> Self {
        Self {
            min_channels: format::MIN_CHANNELS,
            max_channels: format::MAX_CHANNELS,
            min_samplerate: format::MIN_SAMPLERATE,
            max_samplerate: format::MAX_SAMPLERATE,
            min_buffer_size: format::MIN_BUFFER_SIZE,
            max_buffer_size: format::MAX_BUFFER_SIZE,
        }
    }
}

impl DeviceCapabilities {
    pub fn with_channels(mut self, min: usize, max: usize) -> Self {
        self.min_channels = min;
        self.max_channels = max;
        self
    }

    pub fn with_samplerates(mut self, min: u32, max: u32) -> Self {
        self.min_samplerate = min;
        self.max_samplerate = max;
        self
    }

    pub fn with_buffer_sizes(mut self, min: usize, max: usize) -> Self {
        self.min_buffer_size = min;
        self.max_buffer_size = max;
        self
    }

    /// Checks channels, then samplerate, then buffer size.
    pub fn check(&self, presets: &Presets) -> Result<()> {
        if !(self.min_channels..=self.max_channels).contains(&presets.channels) {
            return Err(BackendError::UnsupportedChannels(presets.channels));
        }
        if !(self.min_samplerate..=self.max_samplerate).contains(&presets.samplerate) {
            return Err(BackendError::UnsupportedRate(presets.samplerate));
        }
        if !(self.min_buffer_size..=self.max_buffer_size).contains(&presets.buffer_size) {
            return Err(BackendError::UnsupportedBufferSize(presets.buffer_size));
        }
        Ok(())
    }
}

/// How a backend is paced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Driving {
    SelfDriven,
    Callback,
}

/// Which way periods cross between the ring and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Playback,
    Capture,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("device {0} is busy")]
    DeviceBusy(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("sample format {0:?} unsupported")]
    UnsupportedFormat(soundcard_rt::SampleFormat),
    #[error("samplerate {0} Hz unsupported")]
    UnsupportedRate(u32),
    #[error("{0} channel(s) unsupported")]
    UnsupportedChannels(usize),
    #[error("buffer size {0} unsupported")]
    UnsupportedBufferSize(usize),
    #[error("hardware rejected parameters: {0}")]
    HardwareRejectedParameters(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("backend is not open")]
    NotOpen,
    #[error("backend is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Failure of an opaque native primitive.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("native handle busy")]
    Busy,
    #[error("native xrun")]
    Xrun,
    #[error("native stream suspended")]
    Suspended,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One native audio API behind the ring, transport and bridge.
///
/// `open` negotiates `presets` with the hardware and binds the shared
/// [`PeriodIo`]; `run_period` moves exactly one period between the ring and
/// the device and ticks the transport once for it.
pub trait BackendAdapter: Send {
    fn name(&self) -> &'static str;
    fn driving(&self) -> Driving;

    fn direction(&self) -> Direction {
        Direction::Playback
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>>;
    fn default_device(&self) -> Result<DeviceId>;
    /// Channel, samplerate and buffer size ranges `device` accepts.
    fn pcm_info(&self, device: &DeviceId) -> Result<DeviceCapabilities>;
    fn open(&mut self, device: &DeviceId, presets: &Presets, io: PeriodIo) -> Result<()>;
    fn is_open(&self) -> bool;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn run_period(&mut self) -> Result<PeriodOutcome>;
    /// Plays what is still pending in the ring, then releases native handles.
    fn close(&mut self) -> Result<()>;
}

impl<B: BackendAdapter + ?Sized> BackendAdapter for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn driving(&self) -> Driving {
        (**self).driving()
    }

    fn direction(&self) -> Direction {
        (**self).direction()
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        (**self).devices()
    }

    fn default_device(&self) -> Result<DeviceId> {
        (**self).default_device()
    }

    fn pcm_info(&self, device: &DeviceId) -> Result<DeviceCapabilities> {
        (**self).pcm_info(device)
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets, io: PeriodIo) -> Result<()> {
        (**self).open(device, presets, io)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn stop(&mut self) -> Result<()> {
        (**self).stop()
    }

    fn run_period(&mut self) -> Result<PeriodOutcome> {
        (**self).run_period()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Rejects presets the device cannot take or the ring layout of `io` was not
/// built for.
pub(crate) fn check_open(
    capabilities: &DeviceCapabilities,
    presets: &Presets,
    io: &PeriodIo,
) -> Result<()> {
    capabilities.check(presets)?;
    check_presets(presets, io)
}


fn check_presets(presets: &Presets, io: &PeriodIo) -> Result<()> {
    if io.presets() != presets {
        return Err(BackendError::HardwareRejectedParameters(format!(
            "ring laid out for {:?}, device asked for {:?}",
            io.presets(),
            presets
        )));
    }
    Ok(())
}
