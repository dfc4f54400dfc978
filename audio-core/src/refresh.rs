//! Background refresh worker and its pause/resume protocol.
//!
//! REDESIGN (see `SPEC_FULL.md` SS9): the original `ChannelRefresher` used
//! volatile `paused`/`refreshing` flags and a busy-wait inside `pause()`
//! (`while(refreshing) Sys_Sleep(0)`). Here `pause()` blocks on a condvar
//! that the worker signals when its in-flight refresh cycle completes, and
//! `resume()` is a simple flag clear + notify. No thread ever spins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// What the worker calls on every playing channel each cycle. Implemented by
/// `Mixer`/`Driver` glue in `system.rs`; kept as a trait so the worker can be
/// tested without a real driver.
pub trait Refreshable: Send + Sync {
    /// Top up every channel's buffer; returns when the pass is complete.
    fn refresh_all(&self);
}

/// The pause/resume contract `SampleCache` eviction and channel selection
/// depend on.
pub trait RefreshGate: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// A `RefreshGate` that does nothing — used where no worker is running yet
/// (construction order) or in tests that don't need the protocol.
pub struct NullRefreshGate;

impl RefreshGate for NullRefreshGate {
    fn pause(&self) {}
    fn resume(&self) {}
}

const ACTIVE_INTERVAL: Duration = Duration::from_millis(200);
const PAUSED_INTERVAL: Duration = Duration::from_millis(150);
/// SS5 "Cancellation and timeouts": `stop()` joins with this timeout and
/// abandons the worker rather than blocking forever if it hasn't stopped.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct State {
    paused: bool,
    refreshing: bool,
    shutdown: bool,
}

/// Drives a [`Refreshable`] on a dedicated background thread at ~200ms
/// intervals (~150ms while paused, to notice resume sooner).
pub struct RefreshWorker {
    state: Arc<(Mutex<State>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl RefreshWorker {
    pub fn new() -> Self {
        Self {
            state: Arc::new((
                Mutex::new(State {
                    paused: false,
                    refreshing: false,
                    shutdown: false,
                }),
                Condvar::new(),
            )),
            handle: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the background thread. Idempotent; subsequent calls are no-ops.
    pub fn start(&self, target: Arc<dyn Refreshable>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.state.clone();
        let handle = std::thread::spawn(move || worker_loop(state, target));
        *self.handle.lock() = Some(handle);
        tracing::info!("refresh worker started");
    }

    /// Signals the worker to stop and joins it, abandoning the join after
    /// `SHUTDOWN_JOIN_TIMEOUT` if the worker hasn't exited by then (SS5).
    /// Safe to call even if the worker was never started.
    pub fn stop(&self) {
        {
            let (lock, cvar) = &*self.state;
            let mut s = lock.lock();
            s.shutdown = true;
            cvar.notify_all();
        }
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let deadline = std::time::Instant::now() + SHUTDOWN_JOIN_TIMEOUT;
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if std::time::Instant::now() >= deadline {
                tracing::warn!("refresh worker did not stop within the shutdown timeout, abandoning it");
                return;
            }
            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
    }
}

impl Default for RefreshWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshGate for RefreshWorker {
    fn pause(&self) {
        let (lock, cvar) = &*self.state;
        let mut s = lock.lock();
        s.paused = true;
        // Block until any in-flight refresh completes.
        while s.refreshing {
            cvar.wait(&mut s);
        }
    }

    fn resume(&self) {
        let (lock, cvar) = &*self.state;
        let mut s = lock.lock();
        s.paused = false;
        cvar.notify_all();
    }
}

fn worker_loop(state: Arc<(Mutex<State>, Condvar)>, target: Arc<dyn Refreshable>) {
    let (lock, cvar) = &*state;
    loop {
        let (should_refresh, sleep_for) = {
            let s = lock.lock();
            if s.shutdown {
                return;
            }
            (!s.paused, if s.paused { PAUSED_INTERVAL } else { ACTIVE_INTERVAL })
        };

        if should_refresh {
            {
                let mut s = lock.lock();
                // A pause() could have raced us between the check above and
                // here; re-check under the lock before claiming the flag.
                if s.paused || s.shutdown {
                    continue;
                }
                s.refreshing = true;
            }
            target.refresh_all();
            {
                let mut s = lock.lock();
                s.refreshing = false;
                cvar.notify_all();
            }
        }

        std::thread::sleep(sleep_for);
    }
}
