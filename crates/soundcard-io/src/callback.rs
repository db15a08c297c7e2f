//! Callback-driven backends: the native framework owns the audio thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use soundcard_rt::Presets;

use crate::period::{DeviceEvent, PeriodIo, PeriodOutcome};
use crate::{
    check_open, BackendAdapter, BackendError, DeviceCapabilities, DeviceId, DeviceInfo, Driving,
    Result,
};

/// Handle a native callback uses to pull one period.
#[derive(Clone, Debug)]
pub struct HostCallback {
    io: PeriodIo,
}

impl HostCallback {
    pub fn new(io: PeriodIo) -> Self {
        Self { io }
    }

    pub fn presets(&self) -> &Presets {
        self.io.presets()
    }

    /// Copies the next period into `out` in the presets' sample format.
    pub fn process_bytes(&self, out: &mut [u8]) -> PeriodOutcome {
        self.io.host_period(|slot| match slot {
            Some(slot) => {
                let bytes = slot.bytes();
                let len = bytes.len().min(out.len());
                out[..len].copy_from_slice(&bytes[..len]);
                out[len..].fill(0);
            }
            None => out.fill(0),
        })
    }

    /// Decodes the next period into interleaved `f32` with `channels` per frame.
    ///
    /// Device channels beyond the presets stay silent.
    pub fn process_f32(&self, out: &mut [f32], channels: usize) -> PeriodOutcome {
        self.io.host_period(|slot| {
            out.fill(0.0);
            let Some(slot) = slot else {
                return;
            };
            let channels = channels.max(1);
            let presets = slot.presets();
            let frames = (out.len() / channels).min(presets.buffer_size);
            let shared = channels.min(presets.channels);
            for frame in 0..frames {
                for channel in 0..shared {
                    out[frame * channels + channel] = slot.read_sample(frame, channel);
                }
            }
        })
    }

    pub fn notify(&self, event: DeviceEvent) {
        self.io.notify(event);
    }
}

/// A native framework that calls back for audio on a thread it owns.
pub trait CallbackHost: Send {
    fn name(&self) -> &'static str;
    fn devices(&self) -> Result<Vec<DeviceInfo>>;
    fn default_device(&self) -> Result<DeviceId>;

    fn pcm_info(&self, _device: &DeviceId) -> Result<DeviceCapabilities> {
        Ok(DeviceCapabilities::default())
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets, callback: HostCallback) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn close(&mut self);
}

/// Adapts a [`CallbackHost`] to [`BackendAdapter`].
///
/// No thread is created here; the render producer meets the host through
/// the callback bridge.
pub struct CallbackBackend<H: CallbackHost> {
    host: H,
    callback: Option<HostCallback>,
    running: bool,
    scratch: Vec<u8>,
}

impl<H: CallbackHost> CallbackBackend<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            callback: None,
            running: false,
            scratch: Vec::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }
}

impl<H: CallbackHost> BackendAdapter for CallbackBackend<H> {
    fn name(&self) -> &'static str {
        self.host.name()
    }

    fn driving(&self) -> Driving {
        Driving::Callback
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.host.devices()
    }

    fn default_device(&self) -> Result<DeviceId> {
        self.host.default_device()
    }

    fn pcm_info(&self, device: &DeviceId) -> Result<DeviceCapabilities> {
        self.host.pcm_info(device)
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets, io: PeriodIo) -> Result<()> {
        if self.running {
            return Err(BackendError::AlreadyRunning);
        }
        check_open(&self.host.pcm_info(device)?, presets, &io)?;
        io.bridge().reset();
        let callback = HostCallback::new(io);
        self.host.open(device, presets, callback.clone())?;
        tracing::info!(backend = self.host.name(), %device, "opened callback-driven backend");
        self.scratch = vec![0; presets.period_bytes()];
        self.callback = Some(callback);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.callback.is_some()
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(BackendError::AlreadyRunning);
        }
        let callback = self.callback.as_ref().ok_or(BackendError::NotOpen)?;
        let bridge = callback.io.bridge();
        if bridge.is_shutdown() {
            bridge.reset();
        }
        self.host.start()?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        // Release a host callback parked on the bridge before joining it.
        if let Some(callback) = &self.callback {
            callback.io.bridge().shutdown();
        }
        self.running = false;
        self.host.stop()
    }

    /// Simulates one host callback into a scratch buffer.
    ///
    /// With a blocking bridge this needs the render producer running.
    fn run_period(&mut self) -> Result<PeriodOutcome> {
        if self.running {
            return Err(BackendError::AlreadyRunning);
        }
        let callback = self.callback.as_ref().ok_or(BackendError::NotOpen)?;
        Ok(callback.process_bytes(&mut self.scratch))
    }

    fn close(&mut self) -> Result<()> {
        self.stop()?;
        if let Some(callback) = self.callback.take() {
            callback.io.bridge().shutdown();
            let pending = callback.io.ring().pending();
            if pending > 0 {
                tracing::debug!(pending, "host closed with periods still queued");
            }
            self.host.close();
        }
        Ok(())
    }
}

/// Callback host driven by a timer thread, standing in for a native
/// framework in tests and headless runs.
#[derive(Default)]
pub struct TimerHost {
    callback: Option<HostCallback>,
    worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
    callbacks: Arc<AtomicU64>,
}

impl TimerHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks issued so far, shared across restarts.
    pub fn callbacks(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.callbacks)
    }
}

impl CallbackHost for TimerHost {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            id: DeviceId::new("timer"),
            name: "Timer-driven host".into(),
            is_default_output: true,
        }])
    }

    fn default_device(&self) -> Result<DeviceId> {
        Ok(DeviceId::new("timer"))
    }

    fn open(
        &mut self,
        _device: &DeviceId,
        _presets: &Presets,
        callback: HostCallback,
    ) -> Result<()> {
        self.callback = Some(callback);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        let callback = self.callback.clone().ok_or(BackendError::NotOpen)?;
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let callbacks = Arc::clone(&self.callbacks);

        let handle = thread::Builder::new()
            .name("soundcard-timer-host".into())
            .spawn(move || {
                let period = callback.presets().period_duration();
                let mut buffer = vec![0u8; callback.presets().period_bytes()];
                let mut deadline = Instant::now();
                callback.notify(DeviceEvent::Started);
                while thread_running.load(Ordering::Acquire) {
                    let outcome = callback.process_bytes(&mut buffer);
                    callbacks.fetch_add(1, Ordering::Relaxed);
                    if outcome == PeriodOutcome::Shutdown {
                        break;
                    }
                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else {
                        deadline = now;
                    }
                }
                callback.notify(DeviceEvent::Stopped);
            })
            .map_err(|err| BackendError::Backend(format!("failed to spawn host thread: {err}")))?;
        self.worker = Some((running, handle));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some((running, handle)) = self.worker.take() else {
            return Ok(());
        };
        running.store(false, Ordering::Release);
        handle.join().map_err(|err| {
            tracing::error!(?err, "failed to join timer host thread");
            BackendError::Backend("host thread panicked".into())
        })
    }

    fn close(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "timer host did not stop cleanly");
        }
        self.callback = None;
    }
}

impl Drop for TimerHost {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        if let Some(callback) = &self.callback {
            callback.io.bridge().shutdown();
        }
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "timer host did not stop cleanly");
        }
    }
}
