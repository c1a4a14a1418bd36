//! Stack trace provider: walks the current thread, a supplied CPU context, or (via the
//! cross-thread coordinator) another thread's own stack.

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::sync::Arc;

/// A snapshot of the three registers the unwinder needs: instruction pointer, stack pointer and
/// frame pointer. Filled in from an OS-delivered fault context or from a suspended thread's
/// register set.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
}

/// Ordered sequence of raw frame addresses, innermost first. Inline-stored up to the common
/// depth so an ordinary capture never touches the allocator — only a trace deeper than 32 frames
/// spills to the heap.
pub type RawStackTrace = SmallVec<[u64; 32]>;

/// Per-frame callback driven by `walk_stack`. Returning `false` stops the walk early.
pub trait FrameVisitor {
    fn visit_frame(&mut self, pc: u64) -> bool;
}

impl<F: FnMut(u64) -> bool> FrameVisitor for F {
    fn visit_frame(&mut self, pc: u64) -> bool {
        self(pc)
    }
}

const MAX_FRAMES: usize = 256;

pub struct StackTraceProvider {
    coordinator: Arc<Coordinator>,
}

impl StackTraceProvider {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Walks the current thread (via `libunwind`'s local cursor) if `context` is `None`, otherwise
    /// unwinds directly from the supplied register snapshot using a frame-pointer chain.
    pub fn walk_stack(&self, listener: &mut dyn FrameVisitor, context: Option<CpuContext>) -> Result<()> {
        match context {
            None => walk_local(listener),
            Some(ctx) => unsafe { walk_frame_pointer_chain(ctx, listener) },
        }
    }

    /// Captures an ordered frame-address list for `thread_id`. The current thread always takes
    /// the local path (a thread must not suspend itself); any other thread id is dispatched
    /// through the cross-thread coordinator, which runs the capture on the target thread's own
    /// stack and publishes the result back.
    pub fn get_thread_stack_trace(&self, thread_id: libc::pthread_t) -> Result<RawStackTrace> {
        if thread_id == current_thread_id() {
            let mut frames = RawStackTrace::new();
            walk_local(&mut |pc| {
                frames.push(pc);
                frames.len() < MAX_FRAMES
            })?;
            return Ok(frames);
        }
        self.coordinator.capture_remote_stack(thread_id)
    }
}

pub fn current_thread_id() -> libc::pthread_t {
    unsafe { libc::pthread_self() }
}

fn walk_local(listener: &mut dyn FrameVisitor) -> Result<()> {
    let mut cursor = unwind::Cursor::local().map_err(unwind_err)?;
    let mut count = 0;
    loop {
        let ip = cursor.register(unwind::RegNum::IP).map_err(unwind_err)?;
        if !listener.visit_frame(ip) {
            break;
        }
        count += 1;
        if count >= MAX_FRAMES {
            break;
        }
        match cursor.step() {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => break,
        }
    }
    Ok(())
}

fn unwind_err(e: unwind::Error) -> Error {
    Error::Internal(format!("libunwind: {e}"))
}

/// Manual `rbp`-chain walk from an explicit context. Used when the instruction/frame pointers
/// come from somewhere other than the live call stack of the caller (a fault's `ucontext_t`, a
/// suspended thread's register set) where `libunwind`'s local-cursor API doesn't apply.
///
/// # Safety
/// `ctx.fp` must either be 0 or point at a valid, readable `(saved_fp, return_address)` pair on
/// some thread's stack. This holds for contexts obtained from the OS (fault delivery, suspended
/// thread) on platforms compiled with frame pointers preserved (the common case for `-C
/// force-frame-pointers=yes` / debug builds); it is the caller's responsibility on other builds.
unsafe fn walk_frame_pointer_chain(ctx: CpuContext, listener: &mut dyn FrameVisitor) -> Result<()> {
    let mut pc = ctx.pc;
    let mut fp = ctx.fp;

    if !listener.visit_frame(pc) {
        return Ok(());
    }

    for _ in 0..MAX_FRAMES {
        if fp == 0 || fp % std::mem::align_of::<u64>() as u64 != 0 {
            break;
        }
        let saved_fp = std::ptr::read_unaligned((fp) as *const u64);
        let ret_addr = std::ptr::read_unaligned((fp + 8) as *const u64);
        if ret_addr == 0 || saved_fp <= fp {
            break;
        }
        pc = ret_addr;
        fp = saved_fp;
        if !listener.visit_frame(pc) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_visitor_closure_adapter_stops_on_false() {
        let mut seen = Vec::new();
        let mut visitor = |pc: u64| {
            seen.push(pc);
            seen.len() < 2
        };
        assert!(FrameVisitor::visit_frame(&mut visitor, 1));
        assert!(!FrameVisitor::visit_frame(&mut visitor, 2));
        assert_eq!(seen, vec![1, 2]);
    }
}
