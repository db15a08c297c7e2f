//! Self-driven capture: a dedicated thread doing blocking reads into the ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use soundcard_rt::{Health, Presets};

use crate::blocking::DEFAULT_WRITE_RETRIES;
use crate::period::{DeviceEvent, PeriodIo, PeriodOutcome};
use crate::sources::PcmSource;
use crate::{
    check_open, BackendAdapter, BackendError, DeviceCapabilities, DeviceId, DeviceInfo, Direction,
    Driving, Result,
};

pub const DEFAULT_READ_RETRIES: u32 = DEFAULT_WRITE_RETRIES;

struct Worker<S> {
    running: Arc<AtomicBool>,
    handle: JoinHandle<S>,
}

/// Records a [`PcmSource`] into the ring from its own OS thread.
///
/// Each iteration is `acquire write -> native read -> commit write -> tick`.
/// When the graph leaves no slot free the period is read anyway and
/// discarded as an overrun. A failing read is retried up to `read_retries`
/// times before the device is declared lost and the thread exits.
pub struct CaptureBackend<S: PcmSource> {
    source: Option<S>,
    io: Option<PeriodIo>,
    worker: Option<Worker<S>>,
    scratch: Vec<u8>,
    read_retries: u32,
    thread_name: String,
}

impl<S: PcmSource> CaptureBackend<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            io: None,
            worker: None,
            scratch: Vec::new(),
            read_retries: DEFAULT_READ_RETRIES,
            thread_name: "soundcard-capture".into(),
        }
    }

    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// The source, unless the capture thread currently owns it.
    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    fn join_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.running.store(false, Ordering::Release);
        match worker.handle.join() {
            Ok(source) => {
                self.source = Some(source);
                Ok(())
            }
            Err(err) => {
                tracing::error!(?err, "failed to join soundcard capture thread");
                Err(BackendError::Backend("capture thread panicked".into()))
            }
        }
    }
}

impl<S: PcmSource> BackendAdapter for CaptureBackend<S> {
    fn name(&self) -> &'static str {
        self.source.as_ref().map_or("capture", |source| source.name())
    }

    fn driving(&self) -> Driving {
        Driving::SelfDriven
    }

    fn direction(&self) -> Direction {
        Direction::Capture
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .source
            .as_ref()
            .map(|source| source.devices())
            .unwrap_or_default())
    }

    fn default_device(&self) -> Result<DeviceId> {
        self.devices()?
            .into_iter()
            .next()
            .map(|device| device.id)
            .ok_or_else(|| BackendError::DeviceNotFound("default input".into()))
    }

    fn pcm_info(&self, device: &DeviceId) -> Result<DeviceCapabilities> {
        self.source
            .as_ref()
            .ok_or(BackendError::AlreadyRunning)?
            .pcm_info(device)
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets, io: PeriodIo) -> Result<()> {
        if self.worker.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        let source = self.source.as_mut().ok_or(BackendError::NotOpen)?;
        check_open(&source.pcm_info(device)?, presets, &io)?;
        source.open(device, presets)?;
        tracing::info!(
            backend = source.name(),
            %device,
            channels = presets.channels,
            samplerate = presets.samplerate,
            buffer_size = presets.buffer_size,
            "opened capture backend"
        );
        self.scratch = vec![0; presets.period_bytes()];
        self.io = Some(io);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.io.is_some()
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        let io = self.io.clone().ok_or(BackendError::NotOpen)?;
        let source = self.source.take().ok_or(BackendError::NotOpen)?;
        let running = Arc::new(AtomicBool::new(true));
        let retries = self.read_retries;
        let scratch = self.scratch.clone();

        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run(source, io, thread_running, retries, scratch))
            .map_err(|err| {
                BackendError::Backend(format!("failed to spawn capture thread: {err}"))
            })?;
        self.worker = Some(Worker { running, handle });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.join_worker()
    }

    fn run_period(&mut self) -> Result<PeriodOutcome> {
        if self.worker.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        let io = self.io.as_ref().ok_or(BackendError::NotOpen)?;
        let source = self.source.as_mut().ok_or(BackendError::NotOpen)?;
        capture_period(source, io, self.read_retries, &mut self.scratch)
    }

    /// Stops reading and closes the ring; periods already captured can still
    /// be received from it.
    fn close(&mut self) -> Result<()> {
        self.join_worker()?;
        let Some(io) = self.io.take() else {
            return Ok(());
        };
        io.ring().close();
        let pending = io.ring().pending();
        if pending > 0 {
            tracing::debug!(pending, "capture closed with periods still queued");
        }
        if let Some(source) = self.source.as_mut() {
            source.close();
        }
        Ok(())
    }
}

impl<S: PcmSource> Drop for CaptureBackend<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            if let Err(err) = worker.handle.join() {
                tracing::error!(?err, "failed to join soundcard capture thread");
            }
        }
    }
}

fn run<S: PcmSource>(
    mut source: S,
    io: PeriodIo,
    running: Arc<AtomicBool>,
    retries: u32,
    mut scratch: Vec<u8>,
) -> S {
    tracing::debug!("soundcard capture thread started");
    io.notify(DeviceEvent::Started);
    while running.load(Ordering::Acquire) {
        match capture_period(&mut source, &io, retries, &mut scratch) {
            Ok(PeriodOutcome::Shutdown) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::error!(%err, "soundcard capture thread giving up");
                io.health().mark_device_lost();
                io.notify(DeviceEvent::DeviceLost(err.to_string()));
                return source;
            }
        }
    }
    io.notify(DeviceEvent::Stopped);
    tracing::debug!("soundcard capture thread stopped");
    source
}

fn capture_period<S: PcmSource>(
    source: &mut S,
    io: &PeriodIo,
    retries: u32,
    scratch: &mut [u8],
) -> Result<PeriodOutcome> {
    let health = Arc::clone(io.health());
    io.capture(io.period(), scratch, |bytes| {
        read_with_retry(source, bytes, retries, &health)
    })
}

fn read_with_retry<S: PcmSource>(
    source: &mut S,
    bytes: &mut [u8],
    retries: u32,
    health: &Health,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let err = match source.read(bytes) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if attempt >= retries {
            return Err(BackendError::DeviceLost(err.to_string()));
        }
        attempt += 1;
        health.record_read_retry();
        tracing::warn!(%err, attempt, "native read failed, retrying");
        if let Err(err) = source.recover(&err) {
            tracing::debug!(%err, "native recovery failed");
        }
    }
}
