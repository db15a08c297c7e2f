mod common;

use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use soundcard_io::{
    BackendAdapter, BackendError, CaptureBackend, DeviceCapabilities, DeviceEvent, DeviceId,
    Direction, Driving, NativeError, NullSource, PcmSource, PeriodOutcome, RawPcmSource,
    RenderOutcome,
};
use soundcard_rt::{BridgeMode, Presets};

/// Fails every read after the first `healthy` ones.
struct FlakySource {
    healthy: usize,
    reads: Arc<Mutex<usize>>,
}

impl PcmSource for FlakySource {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn open(&mut self, _device: &DeviceId, _presets: &Presets) -> soundcard_io::Result<()> {
        Ok(())
    }

    fn read(&mut self, period: &mut [u8]) -> Result<(), NativeError> {
        let mut reads = self.reads.lock().unwrap();
        if *reads >= self.healthy {
            return Err(NativeError::Xrun);
        }
        *reads += 1;
        period.fill(0x7f);
        Ok(())
    }
}

#[test]
fn run_period_captures_one_slot_and_ticks_once() {
    let io = common::period_io(BridgeMode::Blocking);
    let period = common::presets().period_bytes();
    let mut recording = vec![0x01u8; period];
    recording.extend(std::iter::repeat(0x02u8).take(period));
    let mut backend = CaptureBackend::new(RawPcmSource::from_reader(Cursor::new(recording)));
    assert_eq!(backend.direction(), Direction::Capture);
    assert_eq!(backend.driving(), Driving::SelfDriven);
    backend
        .open(&DeviceId::default(), &common::presets(), io.clone())
        .unwrap();

    assert_eq!(
        backend.run_period().unwrap(),
        PeriodOutcome::Captured { ticks: 0 }
    );
    assert_eq!(io.ring().pending(), 1);
    // 12.5 periods per tick at 120 bpm: the first period stays inside tick 0.
    assert_eq!(io.clock().snapshot().delay_counter(), 1);
    assert_eq!(io.health().report().periods_captured, 1);

    let mut received = Vec::new();
    let outcome = io
        .receive(Duration::from_millis(1), |slot| {
            received.extend_from_slice(slot.bytes())
        })
        .unwrap();
    assert_eq!(outcome, RenderOutcome::Committed);
    assert_eq!(received.len(), period);
    assert!(received.iter().all(|byte| *byte == 0x01));
}

#[test]
fn full_ring_counts_overruns_and_keeps_reading() {
    let io = common::period_io(BridgeMode::Blocking);
    let source = NullSource::unpaced();
    let read = source.periods();
    let mut backend = CaptureBackend::new(source);
    backend
        .open(&DeviceId::default(), &common::presets(), io.clone())
        .unwrap();

    for _ in 0..io.ring().capacity() {
        assert!(matches!(
            backend.run_period().unwrap(),
            PeriodOutcome::Captured { .. }
        ));
    }
    assert!(matches!(
        backend.run_period().unwrap(),
        PeriodOutcome::Overrun { .. }
    ));

    let report = io.health().report();
    assert_eq!(report.periods_captured, 4);
    assert_eq!(report.overruns, 1);
    assert_eq!(read.load(Ordering::Relaxed), 5);
    assert_eq!(io.clock().snapshot().delay_counter(), 5);
}

#[test]
fn failing_reads_escalate_to_device_lost_after_retries() {
    let io = common::period_io(BridgeMode::Blocking);
    let mut backend = CaptureBackend::new(FlakySource {
        healthy: 0,
        reads: Arc::default(),
    })
    .with_read_retries(3);
    backend
        .open(&DeviceId::default(), &common::presets(), io.clone())
        .unwrap();

    let err = backend.run_period().unwrap_err();
    assert!(matches!(err, BackendError::DeviceLost(_)));
    assert_eq!(io.health().report().read_retries, 3);
    assert_eq!(io.ring().pending(), 0);
    assert_eq!(io.clock().snapshot().delay_counter(), 0);
}

#[test]
fn capture_thread_feeds_the_graph_until_closed() {
    let io = common::period_io(BridgeMode::Blocking);
    let mut backend = CaptureBackend::new(NullSource::new());
    backend
        .open(&DeviceId::default(), &common::presets(), io.clone())
        .unwrap();
    backend.start().unwrap();
    assert!(matches!(backend.start(), Err(BackendError::AlreadyRunning)));

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = 0;
    while received < 10 {
        assert!(Instant::now() < deadline, "capture thread stalled");
        let outcome = io
            .receive(io.period() * 4, |slot| {
                assert!(slot.bytes().iter().all(|byte| *byte == 0))
            })
            .unwrap();
        if outcome == RenderOutcome::Committed {
            received += 1;
        }
    }
    backend.close().unwrap();
    assert!(!backend.is_open());

    // What was captured before close is still handed out, then the ring ends.
    loop {
        match io.receive(Duration::from_millis(1), |_| {}).unwrap() {
            RenderOutcome::Committed => {}
            outcome => {
                assert_eq!(outcome, RenderOutcome::Shutdown);
                break;
            }
        }
    }
    let report = io.health().report();
    assert!(report.periods_captured >= 10);
    assert_eq!(report.periods_played, 0);
}

#[test]
fn capture_thread_reports_a_lost_device() {
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let io = common::period_io(BridgeMode::Blocking).with_events(events_tx);
    let reads = Arc::new(Mutex::new(0));
    let mut backend = CaptureBackend::new(FlakySource {
        healthy: 2,
        reads: Arc::clone(&reads),
    })
    .with_read_retries(1);
    backend
        .open(&DeviceId::default(), &common::presets(), io.clone())
        .unwrap();
    backend.start().unwrap();

    assert_eq!(
        events_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        DeviceEvent::Started
    );
    let lost = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(lost, DeviceEvent::DeviceLost(_)));
    backend.stop().unwrap();

    assert!(io.health().is_device_lost());
    assert_eq!(*reads.lock().unwrap(), 2);
    assert_eq!(io.ring().pending(), 2);
}

#[test]
fn capture_open_checks_the_source_capabilities() {
    let io = common::period_io(BridgeMode::Blocking);
    let mono = DeviceCapabilities::default().with_channels(1, 1);
    let source =
        RawPcmSource::from_reader(Cursor::new(Vec::<u8>::new())).with_capabilities(mono);
    let mut backend = CaptureBackend::new(source);
    assert_eq!(backend.pcm_info(&DeviceId::default()).unwrap(), mono);

    let err = backend
        .open(&DeviceId::default(), &common::presets(), io)
        .unwrap_err();
    assert!(matches!(err, BackendError::UnsupportedChannels(2)));
    assert!(!backend.is_open());
}
