use super::{BackendError, DeviceCapabilities, DeviceId, DeviceInfo, Result};
use crate::callback::{CallbackBackend, CallbackHost, HostCallback};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use soundcard_rt::Presets;

pub type CpalBackend = CallbackBackend<CpalHost>;

pub struct CpalHost {
    host: cpal::Host,
    stream: Option<cpal::Stream>,
}

// The stream is created, started, paused and dropped only through `&mut self`.
unsafe impl Send for CpalHost {}

impl Default for CpalHost {
    fn default() -> Self {
        Self {
            host: cpal::default_host(),
            stream: None,
        }
    }
}

impl CpalHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve_device(&self, device: &DeviceId) -> Result<cpal::Device> {
        if device.is_default() {
            return self
                .host
                .default_output_device()
                .ok_or_else(|| BackendError::DeviceNotFound("default output".into()));
        }
        let devices = self
            .host
            .output_devices()
            .map_err(|err| BackendError::Backend(err.to_string()))?;
        for dev in devices {
            if let Ok(name) = dev.name() {
                if name == device.0 {
                    return Ok(dev);
                }
            }
        }
        Err(BackendError::DeviceNotFound(device.0.clone()))
    }
}

impl CallbackHost for CpalHost {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let default_output = self
            .host
            .default_output_device()
            .and_then(|device| device.name().ok())
            .unwrap_or_default();
        let devices = self
            .host
            .output_devices()
            .map_err(|err| BackendError::Backend(err.to_string()))?;
        Ok(devices
            .map(|device| {
                let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                DeviceInfo {
                    id: DeviceId(name.clone()),
                    is_default_output: name == default_output,
                    name,
                }
            })
            .collect())
    }

    fn default_device(&self) -> Result<DeviceId> {
        self.host
            .default_output_device()
            .and_then(|device| device.name().ok())
            .map(DeviceId)
            .ok_or_else(|| BackendError::DeviceNotFound("default output".into()))
    }

    fn pcm_info(&self, device: &DeviceId) -> Result<DeviceCapabilities> {
        let device = self.resolve_device(device)?;
        let supported = device
            .supported_output_configs()
            .map_err(|err| BackendError::HardwareRejectedParameters(err.to_string()))?;
        let mut capabilities: Option<DeviceCapabilities> = None;
        for range in supported {
            let (min_buffer, max_buffer) = match range.buffer_size() {
                cpal::SupportedBufferSize::Range { min, max } => (*min as usize, *max as usize),
                cpal::SupportedBufferSize::Unknown => {
                    let full = DeviceCapabilities::default();
                    (full.min_buffer_size, full.max_buffer_size)
                }
            };
            let channels = range.channels() as usize;
            let (min_rate, max_rate) = (range.min_sample_rate().0, range.max_sample_rate().0);
            capabilities = Some(match capabilities {
                None => DeviceCapabilities {
                    min_channels: channels,
                    max_channels: channels,
                    min_samplerate: min_rate,
                    max_samplerate: max_rate,
                    min_buffer_size: min_buffer,
                    max_buffer_size: max_buffer,
                },
                Some(caps) => DeviceCapabilities {
                    min_channels: caps.min_channels.min(channels),
                    max_channels: caps.max_channels.max(channels),
                    min_samplerate: caps.min_samplerate.min(min_rate),
                    max_samplerate: caps.max_samplerate.max(max_rate),
                    min_buffer_size: caps.min_buffer_size.min(min_buffer),
                    max_buffer_size: caps.max_buffer_size.max(max_buffer),
                },
            });
        }
        capabilities.ok_or_else(|| {
            BackendError::HardwareRejectedParameters("device reports no output configs".into())
        })
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets, callback: HostCallback) -> Result<()> {
        if self.stream.is_some() {
            return Err(BackendError::DeviceBusy(device.to_string()));
        }
        let device = self.resolve_device(device)?;

        let desired_channels = u16::try_from(presets.channels)
            .map_err(|_| BackendError::UnsupportedChannels(presets.channels))?;
        let desired_sample_rate = cpal::SampleRate(presets.samplerate);
        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err(|err| BackendError::HardwareRejectedParameters(err.to_string()))?
            .collect();
        // Each bound alone was checked against `pcm_info`; the combination may
        // still be missing from the device's config list.
        let frames = presets.buffer_size as u32;
        let range = supported
            .into_iter()
            .find(|range| {
                let buffer_fits = match range.buffer_size() {
                    cpal::SupportedBufferSize::Range { min, max } => {
                        (*min..=*max).contains(&frames)
                    }
                    cpal::SupportedBufferSize::Unknown => true,
                };
                range.channels() == desired_channels
                    && range.min_sample_rate() <= desired_sample_rate
                    && range.max_sample_rate() >= desired_sample_rate
                    && buffer_fits
            })
            .ok_or_else(|| {
                BackendError::HardwareRejectedParameters(format!(
                    "no output config with {} channel(s) at {} Hz and {} frames",
                    presets.channels, presets.samplerate, presets.buffer_size
                ))
            })?;

        let mut config = range.with_sample_rate(desired_sample_rate).config();
        config.buffer_size = cpal::BufferSize::Fixed(presets.buffer_size as u32);
        let channels = config.channels as usize;
        let error_callback = callback.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback.process_f32(data, channels);
                },
                move |err| {
                    tracing::error!("cpal stream error: {err}");
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        error_callback.notify(crate::DeviceEvent::DeviceLost(err.to_string()));
                    }
                },
                None,
            )
            .map_err(|err| match err {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    BackendError::DeviceBusy(err.to_string())
                }
                cpal::BuildStreamError::StreamConfigNotSupported => {
                    BackendError::HardwareRejectedParameters(err.to_string())
                }
                other => BackendError::Backend(other.to_string()),
            })?;
        self.stream = Some(stream);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let stream = self.stream.as_ref().ok_or(BackendError::NotOpen)?;
        stream
            .play()
            .map_err(|err| BackendError::Backend(err.to_string()))
    }

    fn stop(&mut self) -> Result<()> {
        match &self.stream {
            Some(stream) => stream
                .pause()
                .map_err(|err| BackendError::Backend(err.to_string())),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }
}
