//! Native read primitives for capture backends.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use soundcard_rt::Presets;

use crate::sinks::RawPcmSink;
use crate::{BackendError, DeviceCapabilities, DeviceId, DeviceInfo, NativeError, Result};

/// Blocking native input consumed by [`CaptureBackend`](crate::CaptureBackend).
///
/// `read` fills one interleaved period in the presets' sample format and
/// returns once the device delivered it.
pub trait PcmSource: Send + 'static {
    fn name(&self) -> &'static str;

    fn devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    fn pcm_info(&self, _device: &DeviceId) -> Result<DeviceCapabilities> {
        Ok(DeviceCapabilities::default())
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets) -> Result<()>;

    fn read(&mut self, period: &mut [u8]) -> std::result::Result<(), NativeError>;

    /// Called before a read is retried.
    fn recover(&mut self, _err: &NativeError) -> std::result::Result<(), NativeError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Delivers silence, paced like hardware unless built [`unpaced`](Self::unpaced).
#[derive(Debug, Clone, Default)]
pub struct NullSource {
    paced: bool,
    period: Duration,
    deadline: Option<Instant>,
    periods: Arc<AtomicU64>,
}

impl NullSource {
    pub fn new() -> Self {
        Self {
            paced: true,
            ..Self::default()
        }
    }

    pub fn unpaced() -> Self {
        Self::default()
    }

    /// Counter of delivered periods, shared with every clone.
    pub fn periods(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.periods)
    }
}

impl PcmSource for NullSource {
    fn name(&self) -> &'static str {
        "null-capture"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        vec![DeviceInfo {
            id: DeviceId::new("null"),
            name: "Null input".into(),
            is_default_output: false,
        }]
    }

    fn open(&mut self, _device: &DeviceId, presets: &Presets) -> Result<()> {
        self.period = presets.period_duration();
        self.deadline = None;
        Ok(())
    }

    fn read(&mut self, period: &mut [u8]) -> std::result::Result<(), NativeError> {
        if self.paced {
            let now = Instant::now();
            let deadline = self.deadline.unwrap_or(now) + self.period;
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.deadline = Some(deadline.max(now));
        }
        period.fill(0);
        self.periods.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Reads raw interleaved PCM from a device node, FIFO or any reader.
///
/// Like its output counterpart it follows the OSS convention of a character
/// device whose `read` blocks until the hardware captured a full period.
pub struct RawPcmSource {
    default_path: PathBuf,
    reader: Option<Box<dyn Read + Send>>,
    attached: bool,
    capabilities: DeviceCapabilities,
}

impl RawPcmSource {
    pub const DEFAULT_PATH: &'static str = "/dev/dsp";

    pub fn new(default_path: impl AsRef<Path>) -> Self {
        Self {
            default_path: default_path.as_ref().to_path_buf(),
            reader: None,
            attached: false,
            capabilities: DeviceCapabilities::default(),
        }
    }

    /// Reads from `reader` instead of opening a device path.
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            default_path: PathBuf::from(Self::DEFAULT_PATH),
            reader: Some(Box::new(reader)),
            attached: true,
            capabilities: DeviceCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl Default for RawPcmSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PATH)
    }
}

impl std::fmt::Debug for RawPcmSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPcmSource")
            .field("default_path", &self.default_path)
            .field("open", &self.reader.is_some())
            .field("attached", &self.attached)
            .finish()
    }
}

impl PcmSource for RawPcmSource {
    fn name(&self) -> &'static str {
        "raw-pcm-capture"
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        let path = self.default_path.display().to_string();
        vec![DeviceInfo {
            id: DeviceId::new(path.clone()),
            name: path,
            is_default_output: false,
        }]
    }

    fn pcm_info(&self, _device: &DeviceId) -> Result<DeviceCapabilities> {
        Ok(self.capabilities)
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets) -> Result<()> {
        RawPcmSink::check_format(presets.format)?;
        if self.attached {
            return Ok(());
        }
        if self.reader.is_some() {
            return Err(BackendError::DeviceBusy(device.to_string()));
        }

        let path = if device.is_default() {
            self.default_path.clone()
        } else {
            PathBuf::from(&device.0)
        };
        let file = File::open(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => BackendError::DeviceNotFound(path.display().to_string()),
            ErrorKind::ResourceBusy | ErrorKind::WouldBlock => {
                BackendError::DeviceBusy(path.display().to_string())
            }
            _ => BackendError::Backend(format!("{}: {err}", path.display())),
        })?;
        tracing::debug!(path = %path.display(), "opened raw pcm capture device");
        self.reader = Some(Box::new(file));
        Ok(())
    }

    fn read(&mut self, period: &mut [u8]) -> std::result::Result<(), NativeError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| NativeError::Io(ErrorKind::NotConnected.into()))?;
        reader.read_exact(period).map_err(|err| match err.kind() {
            ErrorKind::WouldBlock => NativeError::Busy,
            ErrorKind::Interrupted => NativeError::Xrun,
            _ => NativeError::Io(err),
        })
    }

    fn close(&mut self) {
        if !self.attached {
            self.reader = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soundcard_rt::SampleFormat;
    use std::io::Cursor;

    #[test]
    fn raw_source_reads_whole_periods() {
        let mut source = RawPcmSource::from_reader(Cursor::new(vec![1u8, 2, 3, 4, 5, 6]));
        let presets = Presets::new(1, 48_000, 2, SampleFormat::S16);
        source.open(&DeviceId::default(), &presets).unwrap();
        let mut period = [0u8; 4];
        source.read(&mut period).unwrap();
        assert_eq!(period, [1, 2, 3, 4]);
        // Two bytes left: a short read is an error, not a partial period.
        assert!(matches!(source.read(&mut period), Err(NativeError::Io(_))));
    }

    #[test]
    fn missing_capture_node_is_not_found() {
        let mut source = RawPcmSource::new("/nonexistent/soundcard/dsp");
        let err = source
            .open(&DeviceId::default(), &Presets::default())
            .unwrap_err();
        assert!(matches!(err, BackendError::DeviceNotFound(_)));
    }
}
