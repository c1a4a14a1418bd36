//! Cross-thread coordinator: a signal-based request/response handshake that runs a closure on a
//! target thread's own stack and publishes the result back to the caller.
//!
//! Re-expressed from the source's handler-driven callback shape into a plain request/future
//! handshake: [`Coordinator::capture_remote_stack`] publishes a [`RequestSlot`] keyed by the
//! target thread id, sends a dedicated real-time signal (distinct from the fault signals the
//! exception handler installs), and waits for the target's handler to fill it in.

use crate::error::{Error, Result};
use crate::stack::RawStackTrace;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const MAX_FRAMES: usize = 256;
const IDLE: u8 = 0;
const OUTSTANDING: u8 = 1;
const DONE: u8 = 2;

/// How a caller waits for the target thread to finish servicing a request.
#[derive(Debug, Clone, Copy)]
pub enum WaitMode {
    /// Block on the slot's condition variable.
    Block,
    /// Poll the atomic done-flag at the given interval, with an overall deadline.
    Poll {
        interval: Duration,
        deadline: Duration,
    },
}

struct RequestSlot {
    state: AtomicU8,
    frames: Mutex<[u64; MAX_FRAMES]>,
    frame_count: AtomicUsize,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl RequestSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            frames: Mutex::new([0; MAX_FRAMES]),
            frame_count: AtomicUsize::new(0),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }
}

static REGISTRY: Lazy<Mutex<HashMap<libc::pthread_t, std::sync::Arc<RequestSlot>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static HANDLER_INSTALLED: std::sync::Once = std::sync::Once::new();

/// The signal used to request a remote stack capture. Chosen distinct from `SIGSEGV` & co so it
/// never races with the exception handler's fault signals.
fn capture_signal() -> c_int {
    unsafe { libc::SIGRTMIN() + 5 }
}

fn install_handler_once() {
    HANDLER_INSTALLED.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_capture_signal as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(capture_signal(), &action, std::ptr::null_mut());
    });
}

/// Runs on the target thread, interrupted out of whatever it was doing. Looks itself up by
/// thread id, walks its own stack into the slot's fixed-size buffer (no allocation), and wakes
/// the waiting caller.
extern "C" fn on_capture_signal(_sig: c_int) {
    let tid = unsafe { libc::pthread_self() };
    let slot = {
        let registry = match REGISTRY.try_lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        registry.get(&tid).cloned()
    };
    let Some(slot) = slot else { return };

    let mut count = 0usize;
    if let Ok(mut frames) = slot.frames.try_lock() {
        let mut cursor = match unwind::Cursor::local() {
            Ok(c) => c,
            Err(_) => {
                finish(&slot, 0);
                return;
            }
        };
        loop {
            let Ok(ip) = cursor.register(unwind::RegNum::IP) else {
                break;
            };
            if count >= MAX_FRAMES {
                break;
            }
            frames[count] = ip;
            count += 1;
            match cursor.step() {
                Ok(true) => continue,
                _ => break,
            }
        }
    }
    finish(&slot, count);
}

fn finish(slot: &RequestSlot, count: usize) {
    slot.frame_count.store(count, Ordering::Relaxed);
    slot.state.store(DONE, Ordering::Release);
    let _guard = slot.mutex.lock().unwrap_or_else(|e| e.into_inner());
    drop(_guard);
    slot.cv.notify_all();
}

/// Process-wide coordinator. A thin facade; all state lives in the static registry above because
/// the signal handler has no way to reach an instance method.
pub struct Coordinator {
    default_wait: WaitMode,
}

impl Coordinator {
    pub fn new() -> Self {
        install_handler_once();
        Self {
            default_wait: WaitMode::Block,
        }
    }

    pub fn with_default_wait_mode(wait: WaitMode) -> Self {
        install_handler_once();
        Self { default_wait: wait }
    }

    /// Captures `thread_id`'s call stack by signaling it and waiting for its handler to publish
    /// the result. At most one outstanding request per target thread; a second call while the
    /// first is still in flight returns [`Error::ResourceBusy`].
    pub fn capture_remote_stack(&self, thread_id: libc::pthread_t) -> Result<RawStackTrace> {
        self.capture_remote_stack_with(thread_id, self.default_wait)
    }

    pub fn capture_remote_stack_with(
        &self,
        thread_id: libc::pthread_t,
        wait: WaitMode,
    ) -> Result<RawStackTrace> {
        let slot = {
            let mut registry = REGISTRY.lock().expect("coordinator registry lock poisoned");
            registry
                .entry(thread_id)
                .or_insert_with(|| std::sync::Arc::new(RequestSlot::new()))
                .clone()
        };

        // A previous cancelled wait may have left a stale DONE result uncollected; reclaim it
        // before claiming the slot so the handler's eventual completion doesn't race us.
        let _ = slot
            .state
            .compare_exchange(DONE, IDLE, Ordering::AcqRel, Ordering::Relaxed);

        slot.state
            .compare_exchange(IDLE, OUTSTANDING, Ordering::AcqRel, Ordering::Relaxed)
            .map_err(|_| Error::ResourceBusy)?;

        let sent = unsafe { libc::pthread_kill(thread_id, capture_signal()) };
        if sent != 0 {
            slot.state.store(IDLE, Ordering::Release);
            return Err(Error::SystemFailure(std::io::Error::from_raw_os_error(sent)));
        }

        match wait {
            WaitMode::Block => {
                let guard = slot.mutex.lock().expect("coordinator slot lock poisoned");
                let _unused = slot
                    .cv
                    .wait_while(guard, |_| slot.state.load(Ordering::Acquire) != DONE)
                    .expect("coordinator slot lock poisoned");
            }
            WaitMode::Poll { interval, deadline } => {
                let start = Instant::now();
                while slot.state.load(Ordering::Acquire) != DONE {
                    if start.elapsed() >= deadline {
                        // Abandon the wait; the handler still completes and the next claim
                        // reaps the stale DONE state above.
                        return Err(Error::SystemFailure(std::io::Error::from(
                            std::io::ErrorKind::TimedOut,
                        )));
                    }
                    std::thread::sleep(interval);
                }
            }
        }

        let count = slot.frame_count.load(Ordering::Relaxed);
        let frames = slot.frames.lock().expect("coordinator slot lock poisoned");
        let result = RawStackTrace::from_slice(&frames[..count]);
        drop(frames);
        slot.state.store(IDLE, Ordering::Release);
        Ok(result)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_outstanding_request_is_busy() {
        let slot = std::sync::Arc::new(RequestSlot::new());
        slot.state
            .compare_exchange(IDLE, OUTSTANDING, Ordering::AcqRel, Ordering::Relaxed)
            .unwrap();
        assert!(slot
            .state
            .compare_exchange(IDLE, OUTSTANDING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err());
    }
}
