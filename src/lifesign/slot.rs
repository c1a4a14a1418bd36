//! Thread-area slot allocation: a small FIFO of vacant slot indices guarded by a plain mutex (slot
//! claims are rare compared to life-sign writes, so there's no case for anything lock-free here).
//! Each thread that writes a life-sign record claims a slot on first use and publishes it to a
//! thread-local; the thread-local's destructor releases the slot back to the pool when the thread
//! exits, using the classic `index + 1` sentinel since `0` is a valid slot index and TLS values
//! need a way to express "never claimed" distinct from "claimed slot 0".

use crate::error::{Error, Result};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct SlotAllocator {
    vacant: Mutex<VecDeque<u32>>,
}

impl SlotAllocator {
    pub fn new(max_threads: u32) -> Self {
        Self {
            vacant: Mutex::new((0..max_threads).collect()),
        }
    }

    /// Pops the front of the FIFO: the slot that has been vacant longest.
    pub fn claim(&self) -> Result<u32> {
        self.vacant
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(Error::ResourceLimit("no free life-sign thread slots"))
    }

    /// Pushes to the back, per the vacant-slot list's FIFO discipline: a freshly released slot is
    /// reclaimed only after every longer-idle slot has been reused.
    pub fn release(&self, slot: u32) {
        self.vacant.lock().unwrap().push_back(slot);
    }
}

thread_local! {
    /// `0` means "never claimed a slot in this process' life-sign segment"; a claimed slot is
    /// stored as `slot_id + 1`.
    static CLAIMED_SLOT: Cell<u32> = const { Cell::new(0) };
}

/// Returns this thread's slot, claiming one from `allocator` on first call. `on_release` runs
/// exactly once, right before the slot goes back to the pool, so the caller can stamp `end_ms`
/// and flip `state` to even in the slot header. The returned bool is `true` exactly on the call
/// that performed the claim, so the caller can stamp the claim-side header fields only once.
pub fn slot_for_current_thread(
    allocator: &'static SlotAllocator,
    on_release: impl FnOnce(u32) + 'static,
) -> Result<(u32, bool)> {
    let claimed = CLAIMED_SLOT.with(|cell| cell.get());
    if claimed != 0 {
        return Ok((claimed - 1, false));
    }

    let slot = allocator.claim()?;
    CLAIMED_SLOT.with(|cell| cell.set(slot + 1));
    RELEASE_GUARD.with(|guard| {
        guard.borrow_mut().replace(ReleaseOnExit {
            allocator,
            slot,
            on_release: Some(Box::new(on_release)),
        })
    });
    Ok((slot, true))
}

struct ReleaseOnExit {
    allocator: &'static SlotAllocator,
    slot: u32,
    on_release: Option<Box<dyn FnOnce(u32)>>,
}

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(self.slot);
        }
        self.allocator.release(self.slot);
    }
}

thread_local! {
    static RELEASE_GUARD: std::cell::RefCell<Option<ReleaseOnExit>> = const { std::cell::RefCell::new(None) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_release_reuses_slot() {
        let allocator = SlotAllocator::new(4);
        let a = allocator.claim().unwrap();
        allocator.release(a);
        let b = allocator.claim().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhausted_allocator_reports_resource_limit() {
        let allocator = SlotAllocator::new(1);
        allocator.claim().unwrap();
        assert!(matches!(allocator.claim(), Err(Error::ResourceLimit(_))));
    }
}
