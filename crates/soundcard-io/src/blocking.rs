//! Reference self-driven backend: a dedicated thread doing blocking writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use soundcard_rt::{Health, Presets};

use crate::period::{DeviceEvent, PeriodIo, PeriodOutcome};
use crate::sinks::PcmSink;
use crate::{
    check_open, BackendAdapter, BackendError, DeviceCapabilities, DeviceId, DeviceInfo, Driving,
    Result,
};

pub const DEFAULT_WRITE_RETRIES: u32 = 4;

struct Worker<S> {
    running: Arc<AtomicBool>,
    handle: JoinHandle<S>,
}

/// Plays the ring through a [`PcmSink`] from its own OS thread.
///
/// Each iteration is `acquire read -> native write -> commit read -> tick`.
/// A failing write is retried up to `write_retries` times before the device
/// is declared lost and the thread exits.
pub struct BlockingBackend<S: PcmSink> {
    sink: Option<S>,
    io: Option<PeriodIo>,
    worker: Option<Worker<S>>,
    write_retries: u32,
    thread_name: String,
}

impl<S: PcmSink> BlockingBackend<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Some(sink),
            io: None,
            worker: None,
            write_retries: DEFAULT_WRITE_RETRIES,
            thread_name: "soundcard-io".into(),
        }
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// The sink, unless the io thread currently owns it.
    pub fn sink(&self) -> Option<&S> {
        self.sink.as_ref()
    }

    fn join_worker(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.running.store(false, Ordering::Release);
        match worker.handle.join() {
            Ok(sink) => {
                self.sink = Some(sink);
                Ok(())
            }
            Err(err) => {
                tracing::error!(?err, "failed to join soundcard io thread");
                Err(BackendError::Backend("io thread panicked".into()))
            }
        }
    }
}

impl<S: PcmSink> BackendAdapter for BlockingBackend<S> {
    fn name(&self) -> &'static str {
        self.sink.as_ref().map_or("blocking", |sink| sink.name())
    }

    fn driving(&self) -> Driving {
        Driving::SelfDriven
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.sink.as_ref().map(|sink| sink.devices()).unwrap_or_default())
    }

    fn default_device(&self) -> Result<DeviceId> {
        self.devices()?
            .into_iter()
            .find(|device| device.is_default_output)
            .map(|device| device.id)
            .ok_or_else(|| BackendError::DeviceNotFound("default output".into()))
    }

    fn pcm_info(&self, device: &DeviceId) -> Result<DeviceCapabilities> {
        self.sink.as_ref().ok_or(BackendError::AlreadyRunning)?.pcm_info(device)
    }

    fn open(&mut self, device: &DeviceId, presets: &Presets, io: PeriodIo) -> Result<()> {
        if self.worker.is_some() {
            return Err(BackendError::AlreadyRunning);
        }
        let sink = self.sink.as_mut().ok_or(BackendError::NotOpen)?;
        check_open(&sink.pcm_info(device)?, presets, &io)?;
        sink.open(device, presets)?;
        tracing::info!(
            backend = sink.name(),
            %device,
            channels = presets.channels,
            samplerate = presets.samplerate,
            buffer_size = presets.buffer_size,
            "opened self-driven backend"
        );
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
        let sink = self.sink.take().ok_or(BackendError::NotOpen)?;
        let running = Arc::new(AtomicBool::new(true));
        let retries = self.write_retries;

        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run(sink, io, thread_running, retries))
            .map_err(|err| BackendError::Backend(format!("failed to spawn io thread: {err}")))?;
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
        let sink = self.sink.as_mut().ok_or(BackendError::NotOpen)?;
        play_period(sink, io, self.write_retries)
    }

    fn close(&mut self) -> Result<()> {
        self.join_worker()?;
        let Some(io) = self.io.take() else {
            return Ok(());
        };
        if let Some(sink) = self.sink.as_mut() {
            let health = Arc::clone(io.health());
            let retries = self.write_retries;
            let flushed = io.drain(|bytes| write_with_retry(sink, bytes, retries, &health));
            match flushed {
                Ok(periods) => tracing::debug!(periods, "flushed pending periods"),
                Err(err) => tracing::warn!(%err, "dropping pending periods at close"),
            }
            if let Err(err) = sink.flush() {
                tracing::warn!(%err, "native flush failed at close");
            }
            sink.close();
        }
        Ok(())
    }
}

impl<S: PcmSink> Drop for BlockingBackend<S> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            if let Err(err) = worker.handle.join() {
                tracing::error!(?err, "failed to join soundcard io thread");
            }
        }
    }
}

fn run<S: PcmSink>(mut sink: S, io: PeriodIo, running: Arc<AtomicBool>, retries: u32) -> S {
    tracing::debug!("soundcard io thread started");
    io.notify(DeviceEvent::Started);
    while running.load(Ordering::Acquire) {
        match play_period(&mut sink, &io, retries) {
            Ok(PeriodOutcome::Shutdown) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::error!(%err, "soundcard io thread giving up");
                io.health().mark_device_lost();
                io.notify(DeviceEvent::DeviceLost(err.to_string()));
                return sink;
            }
        }
    }
    io.notify(DeviceEvent::Stopped);
    tracing::debug!("soundcard io thread stopped");
    sink
}

fn play_period<S: PcmSink>(sink: &mut S, io: &PeriodIo, retries: u32) -> Result<PeriodOutcome> {
    let health = Arc::clone(io.health());
    io.consume(io.period(), |bytes| write_with_retry(sink, bytes, retries, &health))
}

fn write_with_retry<S: PcmSink>(
    sink: &mut S,
    bytes: &[u8],
    retries: u32,
    health: &Health,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let err = match sink.write(bytes) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if attempt >= retries {
            return Err(BackendError::DeviceLost(err.to_string()));
        }
        attempt += 1;
        health.record_write_retry();
        tracing::warn!(%err, attempt, "native write failed, retrying");
        if let Err(err) = sink.recover(&err) {
            tracing::debug!(%err, "native recovery failed");
        }
    }
}
