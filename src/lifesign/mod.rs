//! Life-sign shared-memory layer: one segment per process holding a static header, a
//! monotonically-appended context area, and a life-sign area partitioned into fixed-size
//! per-thread ring buffers. Ties together [`header`], [`shm`], [`context_area`], [`thread_area`],
//! [`slot`] and [`discovery`].

pub mod context_area;
pub mod discovery;
pub mod header;
pub mod shm;
pub mod slot;
pub mod thread_area;

use crate::error::{Error, Result};
use header::{ContextAreaHeader, LifeSignHeader, SegmentGeometry, ThreadAreaHeader};
use memmap2::{Mmap, MmapMut};
use shm::MappingOrigin;
use slot::SlotAllocator;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Everything a writer needs to validate a segment request before committing to an allocation.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    pub max_threads: u32,
    pub context_area_size: u32,
    pub life_sign_area_size: u32,
}

impl SegmentLimits {
    fn validate(&self) -> Result<()> {
        if self.max_threads == 0 || self.max_threads > header::MAX_THREADS {
            return Err(Error::InvalidArgument(format!(
                "max_threads must be in 1..={}",
                header::MAX_THREADS
            )));
        }
        if self.context_area_size > header::MAX_CONTEXT_AREA_BYTES {
            return Err(Error::InvalidArgument("context_area_size exceeds limit".into()));
        }
        if self.life_sign_area_size > header::MAX_LIFESIGN_AREA_BYTES {
            return Err(Error::InvalidArgument("life_sign_area_size exceeds limit".into()));
        }
        Ok(())
    }
}

/// Writer-side handle: owns the read-write mapping and the in-process slot allocator.
pub struct LifeSignManager {
    mmap: MmapMut,
    geometry: SegmentGeometry,
    name: String,
    slots: SlotAllocator,
}

/// # Safety
/// Every accessor below assumes `offset` was produced by `self.geometry` against a mapping of at
/// least `geometry.total_size(..)` bytes, and that the target type's natural alignment divides
/// `offset` (guaranteed by `SegmentGeometry::compute`'s 8-byte rounding).
unsafe fn cast<T>(bytes: &[u8], offset: u32) -> &T {
    &*(bytes.as_ptr().add(offset as usize) as *const T)
}

#[allow(clippy::mut_from_ref)]
unsafe fn cast_mut<T>(bytes: &[u8], offset: u32) -> &mut T {
    &mut *(bytes.as_ptr().add(offset as usize) as *mut T)
}

impl LifeSignManager {
    pub fn create(process_basename: &str, limits: SegmentLimits) -> Result<Self> {
        limits.validate()?;
        let geometry =
            SegmentGeometry::compute(limits.max_threads, limits.context_area_size, limits.life_sign_area_size);
        let total_size = geometry.total_size(limits.context_area_size) as usize;

        let now_ms = now_epoch_ms();
        let name = shm::segment_name(process_basename, &format_timestamp(now_ms), std::process::id());
        let mut mmap = shm::create(&name, total_size)?;

        let header: &mut LifeSignHeader = unsafe { cast_mut(&mmap, 0) };
        header.init(
            process_basename,
            now_ms,
            std::process::id(),
            limits.context_area_size,
            geometry.context_area_offset,
            limits.max_threads,
            limits.life_sign_area_size,
            geometry.thread_area_base_offset,
            geometry.thread_area_stride,
        );

        let ctx_header: &mut ContextAreaHeader = unsafe { cast_mut(&mmap, geometry.context_area_header_offset) };
        ctx_header.init();

        for slot in 0..limits.max_threads {
            let thread_header: &mut ThreadAreaHeader =
                unsafe { cast_mut(&mmap, geometry.thread_area_offset(slot)) };
            thread_header.init();
        }

        mmap.flush().map_err(Error::SystemFailure)?;

        Ok(Self {
            mmap,
            geometry,
            name,
            slots: SlotAllocator::new(limits.max_threads),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self) -> &LifeSignHeader {
        unsafe { cast(&self.mmap, 0) }
    }

    fn context_header(&self) -> &ContextAreaHeader {
        unsafe { cast(&self.mmap, self.geometry.context_area_header_offset) }
    }

    fn context_area(&self) -> &mut [u8] {
        let size = self.header().context_area_size;
        let offset = self.geometry.context_area_offset as usize;
        unsafe {
            std::slice::from_raw_parts_mut(
                self.mmap.as_ptr().add(offset) as *mut u8,
                size as usize,
            )
        }
    }

    fn thread_header(&self, slot: u32) -> &ThreadAreaHeader {
        unsafe { cast(&self.mmap, self.geometry.thread_area_offset(slot)) }
    }

    fn thread_ring(&self, slot: u32) -> &mut [u8] {
        let ring_offset =
            self.geometry.thread_area_offset(slot) as usize + std::mem::size_of::<ThreadAreaHeader>();
        let capacity = self.geometry.ring_capacity() as usize;
        unsafe {
            std::slice::from_raw_parts_mut(self.mmap.as_ptr().add(ring_offset) as *mut u8, capacity)
        }
    }

    pub fn write_context_record(&self, payload: &[u8]) -> Result<i32> {
        if payload.len() as u32 > header::MAX_RECORD_BYTES {
            return Err(Error::InvalidArgument("context record exceeds MAX_RECORD_BYTES".into()));
        }
        context_area::write(&self.context_header().write_pos, self.context_area(), payload)
    }

    pub fn write_life_sign_record(&self, payload: &[u8]) -> Result<()> {
        if payload.len() as u32 > header::MAX_RECORD_BYTES {
            return Err(Error::InvalidArgument("life-sign record exceeds MAX_RECORD_BYTES".into()));
        }
        let slot = self.claim_slot_for_current_thread()?;
        let thread_header = self.thread_header(slot);
        thread_area::write(
            &thread_header.head,
            &thread_header.tail,
            &thread_header.record_count,
            self.thread_ring(slot),
            payload,
        )
    }

    fn claim_slot_for_current_thread(&self) -> Result<u32> {
        // Safety: `self` outlives every thread that calls into it (it's constructed in `init` and
        // torn down in `term`, per the library's explicit-context design), so treating the
        // allocator as `'static` for the duration of the thread-local's lifetime is sound in
        // practice; a fully generic API would thread a lifetime through `slot_for_current_thread`
        // instead.
        let allocator: &'static SlotAllocator = unsafe { std::mem::transmute(&self.slots) };
        // Safety: same reasoning as the `allocator` cast above — `self` is assumed to outlive the
        // threads that claim slots from it.
        let mmap_base: *const u8 = self.mmap.as_ptr();
        let geometry = self.geometry;
        let on_release = move |slot: u32| {
            let thread_header: &ThreadAreaHeader =
                unsafe { &*(mmap_base.add(geometry.thread_area_offset(slot) as usize) as *const ThreadAreaHeader) };
            thread_header.end_ms.store(now_epoch_ms(), Ordering::Release);
            thread_header.state.fetch_add(1, Ordering::AcqRel);
        };
        let (slot, freshly_claimed) = slot::slot_for_current_thread(allocator, on_release)?;

        if freshly_claimed {
            let thread_header = self.thread_header(slot);
            thread_header.os_thread_id.store(current_os_thread_id(), Ordering::Release);
            thread_header.start_ms.store(now_epoch_ms(), Ordering::Release);
            thread_header.state.fetch_add(1, Ordering::AcqRel);
        }
        Ok(slot)
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(Error::SystemFailure)?;
        self.header()
            .last_sync_time_ms
            .store(now_epoch_ms(), Ordering::Release);
        Ok(())
    }
}

fn current_os_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `YYYY-MM-DD_HH-MM-SS`, UTC. Hand-rolled (no calendar dependency) via the standard
/// days-since-epoch civil-calendar conversion.
fn format_timestamp(epoch_ms: u64) -> String {
    let total_secs = epoch_ms / 1000;
    let days = (total_secs / 86400) as i64;
    let secs_of_day = total_secs % 86400;
    let (hour, min, sec) = (secs_of_day / 3600, (secs_of_day / 60) % 60, secs_of_day % 60);

    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!("{year:04}-{month:02}-{day:02}_{hour:02}-{min:02}-{sec:02}")
}

/// Reader-side handle: opens an existing segment for inspection, possibly from a different
/// process than the one that created it, possibly after that process has died.
pub struct LifeSignInspector {
    mmap: Mmap,
    geometry: SegmentGeometry,
    origin: MappingOrigin,
}

impl LifeSignInspector {
    pub fn open(name: &str) -> Result<Self> {
        let (mmap, origin) = shm::open_for_inspection(name, false)?;
        let header: &LifeSignHeader = unsafe { cast(&mmap, 0) };
        let geometry = SegmentGeometry::compute(
            header.max_threads,
            header.context_area_size,
            header.life_sign_area_size,
        );
        Ok(Self { mmap, geometry, origin })
    }

    pub fn origin(&self) -> MappingOrigin {
        self.origin
    }

    pub fn header(&self) -> &LifeSignHeader {
        unsafe { cast(&self.mmap, 0) }
    }

    pub fn read_context_records(&self) -> Result<Vec<Vec<u8>>> {
        let ctx_header: &ContextAreaHeader = unsafe { cast(&self.mmap, self.geometry.context_area_header_offset) };
        let offset = self.geometry.context_area_offset as usize;
        let size = self.header().context_area_size as usize;
        let area = &self.mmap[offset..offset + size];
        context_area::read_all(area, ctx_header.write_pos.load(Ordering::Acquire))
    }

    pub fn read_thread_records(&self, slot: u32) -> Result<Vec<Vec<u8>>> {
        let thread_header: &ThreadAreaHeader = unsafe { cast(&self.mmap, self.geometry.thread_area_offset(slot)) };
        let ring_offset =
            self.geometry.thread_area_offset(slot) as usize + std::mem::size_of::<ThreadAreaHeader>();
        let capacity = self.geometry.ring_capacity() as usize;
        let ring = &self.mmap[ring_offset..ring_offset + capacity];

        let head = thread_header.head.load(Ordering::Acquire);
        let tail = thread_header.tail.load(Ordering::Acquire);

        let mut records = Vec::new();
        let mut abs_offset = 0u32;
        loop {
            match thread_area::read_at(head, tail, ring, abs_offset) {
                Ok((record, next)) => {
                    records.push(record.bytes().to_vec());
                    abs_offset = next;
                }
                Err(Error::EndOfStream) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    pub fn discover() -> Result<Vec<discovery::DiscoveredSegment>> {
        discovery::enumerate()
    }
}

pub fn unlink(name: &str) -> Result<()> {
    shm::unlink(name)
}

pub fn is_life_sign_segment(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("dbgutil.life-sign."))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_format_matches_expected_shape() {
        // 2024-01-15T10:30:00Z
        let epoch_ms = 1_705_314_600_000u64;
        assert_eq!(format_timestamp(epoch_ms), "2024-01-15_10-30-00");
    }

    #[test]
    fn limits_reject_oversized_requests() {
        let limits = SegmentLimits {
            max_threads: header::MAX_THREADS + 1,
            context_area_size: 1024,
            life_sign_area_size: 4096,
        };
        assert!(matches!(limits.validate(), Err(Error::InvalidArgument(_))));
    }

    // Exercises the full writer-then-inspector round trip through real `/dev/shm` shared memory:
    // create, write a context record and a life-sign record from this thread, sync, then open a
    // fresh read-only mapping and confirm both come back out.
    #[test]
    fn create_write_sync_and_inspect_round_trip() {
        let limits = SegmentLimits {
            max_threads: 4,
            context_area_size: 4096,
            life_sign_area_size: 16 * 1024,
        };
        let manager = LifeSignManager::create("dbgutil-test-roundtrip", limits).unwrap();
        let name = manager.name().to_string();

        manager.write_context_record(b"session-start").unwrap();
        manager.write_life_sign_record(b"heartbeat-1").unwrap();
        manager.sync().unwrap();

        let inspector = LifeSignInspector::open(&name).unwrap();
        assert_eq!(inspector.header().pid, std::process::id());

        let ctx_records = inspector.read_context_records().unwrap();
        assert_eq!(ctx_records, vec![b"session-start".to_vec()]);

        // This thread claimed slot 0 (the only claimant so far on a freshly created allocator).
        let thread_records = inspector.read_thread_records(0).unwrap();
        assert_eq!(thread_records, vec![b"heartbeat-1".to_vec()]);

        drop(inspector);
        unlink(&name).unwrap();
    }
}
