use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use soundcard_rt::{BridgeState, CallbackBridge, Wake};

#[test]
fn host_and_engine_alternate() {
    const CALLBACKS: u64 = 1_000;
    let bridge = CallbackBridge::default();
    let rendered = AtomicU64::new(0);

    thread::scope(|scope| {
        scope.spawn(|| {
            while bridge.wait_for_request() == Wake::Ready {
                rendered.fetch_add(1, Ordering::SeqCst);
                bridge.finish();
            }
        });

        for callback in 0..CALLBACKS {
            bridge.request();
            let wake = bridge.wait_for_finish();
            if callback == 0 {
                // Initial unless the engine already finished the first period.
                assert!(matches!(wake, Wake::Initial | Wake::Ready), "{wake:?}");
            } else {
                assert_eq!(wake, Wake::Ready);
            }
            // Every callback after the first consumes a period the engine finished.
            assert!(rendered.load(Ordering::SeqCst) + 1 >= callback);
        }
        bridge.shutdown();
    });
    assert!(rendered.load(Ordering::SeqCst) >= CALLBACKS - 1);
}

#[test]
fn shutdown_releases_a_parked_engine() {
    let bridge = CallbackBridge::default();
    thread::scope(|scope| {
        let engine = scope.spawn(|| bridge.wait_for_request());
        while bridge.state() != BridgeState::CallbackWait {
            thread::sleep(Duration::from_millis(1));
        }
        bridge.shutdown();
        assert_eq!(engine.join().unwrap(), Wake::Shutdown);
    });
}

#[test]
fn shutdown_releases_a_parked_host() {
    let bridge = CallbackBridge::default();
    bridge.request();
    assert_eq!(bridge.wait_for_finish(), Wake::Initial);
    bridge.request();
    thread::scope(|scope| {
        let host = scope.spawn(|| bridge.wait_for_finish());
        while bridge.state() != BridgeState::CallbackFinishWait {
            thread::sleep(Duration::from_millis(1));
        }
        bridge.shutdown();
        assert_eq!(host.join().unwrap(), Wake::Shutdown);
    });
    assert!(bridge.is_shutdown());
}

enum Step {
    Wait,
    Finish,
}

fn settle(bridge: &CallbackBridge, expected: BridgeState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while bridge.state() != expected {
        assert!(Instant::now() < deadline, "bridge stuck in {:?}", bridge.state());
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn each_side_moves_the_state_it_owns() {
    let bridge = CallbackBridge::default();
    let (steps, engine_steps) = mpsc::channel::<Step>();
    let (engine_replies, replies) = mpsc::channel::<Wake>();

    thread::scope(|scope| {
        scope.spawn(|| {
            for step in engine_steps {
                let wake = match step {
                    Step::Wait => bridge.wait_for_request(),
                    Step::Finish => {
                        bridge.finish();
                        Wake::Ready
                    }
                };
                if engine_replies.send(wake).is_err() {
                    break;
                }
            }
        });

        assert_eq!(bridge.state(), BridgeState::PassThrough);

        // First host callback: nothing has been rendered yet.
        bridge.request();
        assert_eq!(bridge.state(), BridgeState::InitialCallback);
        assert_eq!(bridge.wait_for_finish(), Wake::Initial);
        assert_eq!(bridge.state(), BridgeState::InitialCallback);

        // The engine picks the request up without parking and renders it.
        steps.send(Step::Wait).unwrap();
        assert_eq!(replies.recv().unwrap(), Wake::Ready);
        assert_eq!(bridge.state(), BridgeState::InitialCallback);
        steps.send(Step::Finish).unwrap();
        replies.recv().unwrap();
        assert_eq!(bridge.state(), BridgeState::CallbackFinishDone);

        // With no request pending the engine parks.
        steps.send(Step::Wait).unwrap();
        settle(&bridge, BridgeState::CallbackWait);

        // Second host callback wakes it and consumes the first rendered period.
        bridge.request();
        assert_eq!(replies.recv().unwrap(), Wake::Ready);
        assert_eq!(bridge.state(), BridgeState::CallbackDone);
        assert_eq!(bridge.wait_for_finish(), Wake::Ready);
        assert_eq!(bridge.state(), BridgeState::CallbackDone);

        // Third host callback arrives before the second period is finished.
        bridge.request();
        let host = scope.spawn(|| bridge.wait_for_finish());
        settle(&bridge, BridgeState::CallbackFinishWait);
        steps.send(Step::Finish).unwrap();
        replies.recv().unwrap();
        assert_eq!(host.join().unwrap(), Wake::Ready);
        assert_eq!(bridge.state(), BridgeState::CallbackFinishDone);

        drop(steps);
    });
}

#[test]
fn reset_returns_to_pass_through_and_rearms_the_initial_callback() {
    let bridge = CallbackBridge::default();
    bridge.request();
    assert_eq!(bridge.wait_for_finish(), Wake::Initial);
    bridge.shutdown();
    bridge.reset();
    assert_eq!(bridge.state(), BridgeState::PassThrough);
    bridge.request();
    assert_eq!(bridge.state(), BridgeState::InitialCallback);
    assert_eq!(bridge.wait_for_finish(), Wake::Initial);
}
