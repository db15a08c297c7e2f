//! Rendezvous between the engine thread and a host-owned audio callback.
//!
//! Callback-driven hosts own the thread that consumes periods. One mutex and
//! two conditions keep the engine in step with them:
//!
//! * `callback`: host to engine, "a buffer is needed". The host marks it
//!   [`BridgeState::CallbackDone`], the engine parks in
//!   [`BridgeState::CallbackWait`].
//! * `callback_finish`: engine to host, "the buffer is ready". The engine
//!   marks it [`BridgeState::CallbackFinishDone`], the host parks in
//!   [`BridgeState::CallbackFinishWait`].
//!
//! None of the calls fail. [`CallbackBridge::shutdown`] is the only way to
//! release a parked thread without the peer, and every wait reports it.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    #[default]
    Blocking,
    /// Both waits return at once; for offline or diagnostic rendering.
    PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeState {
    PassThrough,
    InitialCallback,
    CallbackWait,
    CallbackDone,
    CallbackFinishWait,
    CallbackFinishDone,
}

/// Outcome of a bridge wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Ready,
    /// First host callback after open; no buffer has been finished yet.
    Initial,
    Shutdown,
}

#[derive(Debug)]
struct Shared {
    state: BridgeState,
    started: bool,
    requested: bool,
    finished: bool,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: BridgeState::PassThrough,
            started: false,
            requested: false,
            finished: false,
        }
    }
}

/// Every state change happens under `shared`, made by the side that owns it:
/// the host moves to `InitialCallback`, `CallbackDone` and
/// `CallbackFinishWait`; the engine moves to `CallbackWait` and
/// `CallbackFinishDone`.
#[derive(Debug)]
pub struct CallbackBridge {
    mode: BridgeMode,
    shared: Mutex<Shared>,
    shutdown: AtomicBool,
    callback: Condvar,
    callback_finish: Condvar,
}

impl CallbackBridge {
    pub fn new(mode: BridgeMode) -> Self {
        Self {
            mode,
            shared: Mutex::new(Shared::default()),
            shutdown: AtomicBool::new(false),
            callback: Condvar::new(),
            callback_finish: Condvar::new(),
        }
    }

    pub fn mode(&self) -> BridgeMode {
        self.mode
    }

    pub fn state(&self) -> BridgeState {
        self.shared.lock().state
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn passes_through(&self) -> bool {
        self.mode == BridgeMode::PassThrough
    }

    /// Host side: a buffer is needed.
    ///
    /// The first request after open leaves the bridge in
    /// [`BridgeState::InitialCallback`]; every later one in
    /// [`BridgeState::CallbackDone`].
    pub fn request(&self) {
        if self.passes_through() || self.is_shutdown() {
            return;
        }
        let mut shared = self.shared.lock();
        shared.state = if shared.started {
            BridgeState::CallbackDone
        } else {
            shared.started = true;
            BridgeState::InitialCallback
        };
        shared.requested = true;
        self.callback.notify_one();
    }

    /// Engine side: parks in [`BridgeState::CallbackWait`] until the host
    /// requested a buffer.
    pub fn wait_for_request(&self) -> Wake {
        if self.passes_through() {
            return self.wake_state();
        }
        let mut shared = self.shared.lock();
        loop {
            if self.is_shutdown() {
                return Wake::Shutdown;
            }
            if shared.requested {
                shared.requested = false;
                return Wake::Ready;
            }
            shared.state = BridgeState::CallbackWait;
            self.callback.wait(&mut shared);
        }
    }

    /// Engine side: the requested buffer is ready.
    pub fn finish(&self) {
        if self.passes_through() {
            return;
        }
        let mut shared = self.shared.lock();
        shared.state = BridgeState::CallbackFinishDone;
        shared.finished = true;
        self.callback_finish.notify_one();
    }

    /// Host side: parks in [`BridgeState::CallbackFinishWait`] until the
    /// engine finished the previous request.
    ///
    /// While the bridge is still in [`BridgeState::InitialCallback`] there is
    /// no previous request, so the call returns [`Wake::Initial`] at once.
    pub fn wait_for_finish(&self) -> Wake {
        if self.passes_through() {
            return self.wake_state();
        }
        let mut shared = self.shared.lock();
        loop {
            if self.is_shutdown() {
                return Wake::Shutdown;
            }
            if shared.finished {
                shared.finished = false;
                return Wake::Ready;
            }
            if shared.state == BridgeState::InitialCallback {
                return Wake::Initial;
            }
            shared.state = BridgeState::CallbackFinishWait;
            self.callback_finish.wait(&mut shared);
        }
    }

    /// Releases every parked thread; subsequent waits return [`Wake::Shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _shared = self.shared.lock();
        self.callback.notify_all();
        self.callback_finish.notify_all();
    }

    /// Rearms the bridge for a freshly opened device.
    pub fn reset(&self) {
        let mut shared = self.shared.lock();
        *shared = Shared::default();
        self.shutdown.store(false, Ordering::Release);
    }

    fn wake_state(&self) -> Wake {
        if self.is_shutdown() {
            Wake::Shutdown
        } else {
            Wake::Ready
        }
    }
}

impl Default for CallbackBridge {
    fn default() -> Self {
        Self::new(BridgeMode::Blocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_pass_through_state() {
        let bridge = CallbackBridge::default();
        assert_eq!(bridge.state(), BridgeState::PassThrough);
    }

    #[test]
    fn first_host_callback_skips_the_finish_wait() {
        let bridge = CallbackBridge::default();
        bridge.request();
        assert_eq!(bridge.wait_for_finish(), Wake::Initial);
        assert_eq!(bridge.wait_for_request(), Wake::Ready);
        bridge.finish();
        assert_eq!(bridge.state(), BridgeState::CallbackFinishDone);
        assert_eq!(bridge.wait_for_finish(), Wake::Ready);
    }

    #[test]
    fn pass_through_never_parks() {
        let bridge = CallbackBridge::new(BridgeMode::PassThrough);
        assert_eq!(bridge.wait_for_request(), Wake::Ready);
        assert_eq!(bridge.wait_for_finish(), Wake::Ready);
        bridge.shutdown();
        assert_eq!(bridge.wait_for_request(), Wake::Shutdown);
        assert_eq!(bridge.state(), BridgeState::PassThrough);
    }

    #[test]
    fn reset_clears_shutdown() {
        let bridge = CallbackBridge::default();
        bridge.shutdown();
        assert_eq!(bridge.wait_for_request(), Wake::Shutdown);
        bridge.reset();
        bridge.request();
        assert_eq!(bridge.wait_for_request(), Wake::Ready);
    }
}
