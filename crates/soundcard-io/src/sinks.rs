//! Native write primitives for self-driven backends.

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use soundcard_rt::{Presets, SampleFormat};

use crate::{BackendError, DeviceCapabilities, DeviceId, DeviceInfo, NativeError, Result};

/// Blocking native output consumed by [`BlockingBackend`](crate::BlockingBackend).
///
/// `write` receives one interleaved period in the presets' sample format and
/// returns once the device accepted it.
pub trait PcmSink: Send + 'static {
    fn name(&self) -> &'static str;

    fn devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    fn pcm_info(&self, _device: &DeviceId) -> Result<DeviceCapabilities> {
        Ok(DeviceCapabilities::default())
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets) -> Result<()>;

    fn write(&mut self, period: &[u8]) -> std::result::Result<(), NativeError>;

    /// Called before a write is retried.
    fn recover(&mut self, _err: &NativeError) -> std::result::Result<(), NativeError> {
        Ok(())
    }

    fn flush(&mut self) -> std::result::Result<(), NativeError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Discards audio, paced like hardware unless built [`unpaced`](Self::unpaced).
#[derive(Debug, Clone, Default)]
pub struct NullSink {
    paced: bool,
    period: Duration,
    deadline: Option<Instant>,
    periods: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            paced: true,
            ..Self::default()
        }
    }

    pub fn unpaced() -> Self {
        Self::default()
    }

    /// Counter of accepted periods, shared with every clone.
    pub fn periods(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.periods)
    }
}

impl PcmSink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            id: DeviceId::new("null"),
            name: "Null output".into(),
            is_default_output: true,
        }]
    }

    fn open(&mut self, _device: &DeviceId, presets: &Presets) -> Result<()> {
        self.period = presets.period_duration();
        self.deadline = None;
        Ok(())
    }

    fn write(&mut self, _period: &[u8]) -> std::result::Result<(), NativeError> {
        if self.paced {
            let now = Instant::now();
            let deadline = self.deadline.unwrap_or(now) + self.period;
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            // Never try to catch up on periods lost while nobody wrote.
            self.deadline = Some(deadline.max(now));
        }
        self.periods.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Writes raw interleaved PCM to a device node, FIFO or any writer.
///
/// Opening by path follows the OSS convention of a character device that
/// blocks in `write` until the hardware has room.
pub struct RawPcmSink {
    default_path: PathBuf,
    writer: Option<Box<dyn Write + Send>>,
    attached: bool,
    capabilities: DeviceCapabilities,
}

impl RawPcmSink {
    pub const DEFAULT_PATH: &'static str = "/dev/dsp";

    pub fn new(default_path: impl AsRef<Path>) -> Self {
        Self {
            default_path: default_path.as_ref().to_path_buf(),
            writer: None,
            attached: false,
            capabilities: DeviceCapabilities::default(),
        }
    }

    /// Writes into `writer` instead of opening a device path.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            default_path: PathBuf::from(Self::DEFAULT_PATH),
            writer: Some(Box::new(writer)),
            attached: true,
            capabilities: DeviceCapabilities::default(),
        }
    }

    /// Limits the ranges reported for the node, e.g. from `SNDCTL_AUDIOINFO`.
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub(crate) fn check_format(format: SampleFormat) -> Result<()> {
        match format {
            SampleFormat::S8 | SampleFormat::S16 | SampleFormat::S24 | SampleFormat::S32 => Ok(()),
            other => Err(BackendError::UnsupportedFormat(other)),
        }
    }
}

impl Default for RawPcmSink {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl std::fmt::Debug for RawPcmSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPcmSink")
            .field("default_path", &self.default_path)
            .field("open", &self.writer.is_some())
            .field("attached", &self.attached)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl PcmSink for RawPcmSink {
    fn name(&self) -> &'static str {
        "raw-pcm"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        let path = self.default_path.display().to_string();
        vec![DeviceInfo {
            id: DeviceId::new(path.clone()),
            name: path,
            is_default_output: true,
        }]
    }

    fn pcm_info(&self, _device: &DeviceId) -> Result<DeviceCapabilities> {
        Ok(self.capabilities)
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets) -> Result<()> {
        Self::check_format(presets.format)?;
        if self.attached {
            return Ok(());
        }
        if self.writer.is_some() {
            return Err(BackendError::DeviceBusy(device.to_string()));
        }

        let path = if device.is_default() {
            self.default_path.clone()
        } else {
            PathBuf::from(&device.0)
        };
        let file = File::options()
            .write(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => BackendError::DeviceNotFound(path.display().to_string()),
                ErrorKind::ResourceBusy | ErrorKind::WouldBlock => {
                    BackendError::DeviceBusy(path.display().to_string())
                }
                _ => BackendError::Backend(format!("{}: {err}", path.display())),
            })?;
        tracing::debug!(path = %path.display(), "opened raw pcm device");
        self.writer = Some(Box::new(file));
        Ok(())
    }

    fn write(&mut self, period: &[u8]) -> std::result::Result<(), NativeError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| NativeError::Io(ErrorKind::NotConnected.into()))?;
        writer.write_all(period).map_err(|err| match err.kind() {
            ErrorKind::WouldBlock => NativeError::Busy,
            ErrorKind::Interrupted => NativeError::Xrun,
            _ => NativeError::Io(err),
        })
    }

    fn flush(&mut self) -> std::result::Result<(), NativeError> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer.flush()?),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        if !self.attached {
            self.writer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sink_rejects_float_formats() {
        let mut sink = RawPcmSink::from_writer(Vec::new());
        let presets = Presets::new(2, 48_000, 256, SampleFormat::Float);
        let err = sink.open(&DeviceId::default(), &presets).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedFormat(SampleFormat::Float)));
    }

    #[test]
    fn missing_device_node_is_not_found() {
        let mut sink = RawPcmSink::new("/nonexistent/soundcard/dsp");
        let err = sink
            .open(&DeviceId::default(), &Presets::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::DeviceNotFound(_)));
    }

    #[test]
    fn null_sink_paces_at_the_period() {
        let mut sink = NullSink::new();
        let presets = Presets::new(2, 48_000, 480, SampleFormat::S16);
        sink.open(&DeviceId::default(), &presets).unwrap();
        let started = Instant::now();
        for _ in 0..3 {
            sink.write(&[]).unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(29));
        assert_eq!(sink.periods().load(Ordering::Relaxed), 3);
    }
}
