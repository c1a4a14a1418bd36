//! Persisted layout of the life-sign shared-memory segment: the fixed struct sequence described
//! in the data model, little-endian, packed to each field's natural alignment with explicit
//! padding so an external inspector reading the same bytes agrees on offsets.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

pub const MAX_THREADS: u32 = 8192;
pub const MAX_CONTEXT_AREA_BYTES: u32 = 4 * 1024 * 1024;
pub const MAX_LIFESIGN_AREA_BYTES: u32 = 64 * 1024 * 1024;
pub const MAX_RECORD_BYTES: u32 = 4 * 1024;
pub const IMAGE_PATH_LEN: usize = 256;

/// Process-alive state as seen by a guardian that periodically refreshes the header. On the
/// disk-backed platform the segment's existence on disk already answers that question, so this
/// stays `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessAliveState {
    Unknown = 0,
    Alive = 1,
    Dead = 2,
}

/// Fixed-size segment-wide header, first bytes of the mapping.
#[repr(C)]
pub struct LifeSignHeader {
    pub image_path: [u8; IMAGE_PATH_LEN],
    pub start_time_epoch_ms: u64,
    pub pid: u32,
    _pad0: u32,
    pub context_area_size: u32,
    pub context_area_start_offset: u32,
    pub max_threads: u32,
    pub life_sign_area_size: u32,
    pub life_sign_area_start_offset: u32,
    pub thread_area_size: u32,
    _pad1: u32,
    /// Guardian-flow fields: meaningful only on the platform whose shared segment can vanish the
    /// instant its creator's last handle closes. Present here unconditionally for layout
    /// stability; zeroed and unread on the disk-backed platform.
    pub last_process_seen_time_ms: AtomicU64,
    pub last_sync_time_ms: AtomicU64,
    pub process_alive_state: AtomicU32,
    pub fully_synced: AtomicU32,
}

impl LifeSignHeader {
    pub fn init(
        &mut self,
        image_path: &str,
        start_time_epoch_ms: u64,
        pid: u32,
        context_area_size: u32,
        context_area_start_offset: u32,
        max_threads: u32,
        life_sign_area_size: u32,
        life_sign_area_start_offset: u32,
        thread_area_size: u32,
    ) {
        self.image_path = [0u8; IMAGE_PATH_LEN];
        let bytes = image_path.as_bytes();
        let n = bytes.len().min(IMAGE_PATH_LEN - 1);
        self.image_path[..n].copy_from_slice(&bytes[..n]);
        self.start_time_epoch_ms = start_time_epoch_ms;
        self.pid = pid;
        self.context_area_size = context_area_size;
        self.context_area_start_offset = context_area_start_offset;
        self.max_threads = max_threads;
        self.life_sign_area_size = life_sign_area_size;
        self.life_sign_area_start_offset = life_sign_area_start_offset;
        self.thread_area_size = thread_area_size;
        self.last_process_seen_time_ms = AtomicU64::new(0);
        self.last_sync_time_ms = AtomicU64::new(0);
        self.process_alive_state = AtomicU32::new(ProcessAliveState::Unknown as u32);
        self.fully_synced = AtomicU32::new(0);
    }

    pub fn image_path_str(&self) -> String {
        let nul = self.image_path.iter().position(|&b| b == 0).unwrap_or(IMAGE_PATH_LEN);
        String::from_utf8_lossy(&self.image_path[..nul]).into_owned()
    }
}

/// Context area's monotonic write cursor. Writers linearize on the atomic `fetch_add`; no locks.
#[repr(C)]
pub struct ContextAreaHeader {
    pub write_pos: AtomicI32,
    _pad: i32,
}

impl ContextAreaHeader {
    pub fn init(&mut self) {
        self.write_pos = AtomicI32::new(0);
    }
}

/// `state` is an even/odd running counter: odd means the owning thread is currently live, even
/// means stopped; `state/2` is the thread's use count (how many times that slot has been claimed
/// and released).
#[repr(C)]
pub struct ThreadAreaHeader {
    pub os_thread_id: AtomicU64,
    pub start_ms: AtomicU64,
    pub end_ms: AtomicU64,
    pub head: AtomicU32,
    pub tail: AtomicU32,
    pub record_count: AtomicU32,
    pub state: AtomicU32,
}

impl ThreadAreaHeader {
    pub fn init(&mut self) {
        self.os_thread_id = AtomicU64::new(0);
        self.start_ms = AtomicU64::new(0);
        self.end_ms = AtomicU64::new(0);
        self.head = AtomicU32::new(0);
        self.tail = AtomicU32::new(0);
        self.record_count = AtomicU32::new(0);
        self.state = AtomicU32::new(0);
    }

    pub fn is_running(&self) -> bool {
        self.state.load(std::sync::atomic::Ordering::Acquire) % 2 == 1
    }
}

pub fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

/// Byte-offset geometry of the segment, computed once at create/open time from the header's own
/// fields (so a reader with only the mapped bytes, no out-of-band configuration, can navigate
/// it).
#[derive(Debug, Clone, Copy)]
pub struct SegmentGeometry {
    pub context_area_header_offset: u32,
    pub context_area_offset: u32,
    pub thread_area_base_offset: u32,
    pub thread_area_stride: u32,
    pub max_threads: u32,
}

impl SegmentGeometry {
    pub fn compute(max_threads: u32, context_area_size: u32, life_sign_area_size: u32) -> Self {
        let header_size = align_up(std::mem::size_of::<LifeSignHeader>() as u32, 8);
        let context_area_header_offset = header_size;
        let context_area_offset =
            context_area_header_offset + align_up(std::mem::size_of::<ContextAreaHeader>() as u32, 8);
        // 8-byte aligned: `ThreadAreaHeader` carries `AtomicU64` fields and the struct is read
        // back via a raw pointer cast, so every thread area must start on an 8-byte boundary.
        let thread_area_base_offset = align_up(context_area_offset + context_area_size, 8);
        let thread_area_stride = align_up(life_sign_area_size / max_threads.max(1), 8);
        Self {
            context_area_header_offset,
            context_area_offset,
            thread_area_base_offset,
            thread_area_stride,
            max_threads,
        }
    }

    pub fn total_size(&self, context_area_size: u32) -> u32 {
        self.thread_area_base_offset - self.context_area_offset + context_area_size
            + self.thread_area_stride * self.max_threads
    }

    pub fn thread_area_offset(&self, slot: u32) -> u32 {
        self.thread_area_base_offset + slot * self.thread_area_stride
    }

    pub fn ring_capacity(&self) -> u32 {
        self.thread_area_stride - std::mem::size_of::<ThreadAreaHeader>() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_places_thread_areas_after_context() {
        let geo = SegmentGeometry::compute(4, 1024, 4096);
        assert_eq!(geo.thread_area_stride, 1024);
        assert_eq!(geo.thread_area_offset(0), geo.thread_area_base_offset);
        assert_eq!(geo.thread_area_offset(1), geo.thread_area_base_offset + 1024);
        assert!(geo.ring_capacity() < geo.thread_area_stride);
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 4), 8);
    }
}
