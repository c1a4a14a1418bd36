//! Per-thread ring buffer: single-writer, lock-free in steady state. Each record is stored as a
//! 4-byte length (the *aligned* allocation size, not the raw payload length — the terminating
//! null byte inside that allocation is what recovers the exact payload boundary on read) followed
//! by the payload, a null terminator, and zero padding out to a 4-byte boundary.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// A ring position plus capacity pair, used to do wrap-aware reads/writes without re-deriving
/// `capacity` from the caller every time.
struct Ring<'a> {
    bytes: &'a mut [u8],
}

impl<'a> Ring<'a> {
    fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn write_wrapping(&mut self, at: u32, data: &[u8]) {
        let cap = self.capacity();
        let start = at % cap;
        let first = (cap - start).min(data.len() as u32) as usize;
        self.bytes[start as usize..start as usize + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.bytes[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    fn read_wrapping(&self, at: u32, len: u32) -> Vec<u8> {
        let cap = self.capacity();
        let start = at % cap;
        let mut out = vec![0u8; len as usize];
        let first = (cap - start).min(len) as usize;
        out[..first].copy_from_slice(&self.bytes[start as usize..start as usize + first]);
        if first < len as usize {
            out[first..].copy_from_slice(&self.bytes[..len as usize - first]);
        }
        out
    }

    fn write_u32(&mut self, at: u32, value: u32) {
        self.write_wrapping(at, &value.to_le_bytes());
    }

    fn read_u32(&self, at: u32) -> u32 {
        let bytes = self.read_wrapping(at, 4);
        u32::from_le_bytes(bytes.try_into().unwrap())
    }
}

fn cyclic_used(head: u32, tail: u32, capacity: u32) -> u32 {
    (tail + capacity - head) % capacity
}

/// Appends `payload` to the ring, evicting whole records from the head as needed to make room.
/// Never blocks and never fails on a full ring: per the source's contract, overwriting the oldest
/// records is the designed behavior, not an error.
pub fn write(
    head: &AtomicU32,
    tail: &AtomicU32,
    record_count: &AtomicU32,
    ring_bytes: &mut [u8],
    payload: &[u8],
) -> Result<()> {
    let capacity = ring_bytes.len() as u32;
    let aligned_len = crate::lifesign::header::align_up(payload.len() as u32 + 1, 4);
    let entry_len = aligned_len + 4;
    if entry_len > capacity {
        return Err(Error::ResourceLimit("life-sign record exceeds ring capacity"));
    }

    let mut h = head.load(Ordering::Acquire);
    let mut t = tail.load(Ordering::Acquire);
    let mut count = record_count.load(Ordering::Acquire);

    let mut ring = Ring { bytes: ring_bytes };
    while cyclic_used(h, t, capacity) + entry_len > capacity {
        let old_len = ring.read_u32(h);
        h = (h + old_len + 4) % capacity;
        count = count.saturating_sub(1);
    }

    ring.write_u32(t, aligned_len);
    t = (t + 4) % capacity;

    let mut framed = vec![0u8; aligned_len as usize];
    framed[..payload.len()].copy_from_slice(payload);
    framed[payload.len()] = 0;
    ring.write_wrapping(t, &framed);
    t = (t + aligned_len) % capacity;
    count += 1;

    head.store(h, Ordering::Release);
    tail.store(t, Ordering::Release);
    record_count.store(count, Ordering::Release);
    Ok(())
}

/// Result of a single ring read: either a borrowed slice (the common, non-wrapping case) or an
/// owned buffer the caller must release when the record straddled the ring's wrap point.
pub enum RingRecord {
    Borrowed(Vec<u8>),
    Owned(Vec<u8>),
}

impl RingRecord {
    pub fn bytes(&self) -> &[u8] {
        match self {
            RingRecord::Borrowed(b) | RingRecord::Owned(b) => b,
        }
    }

    pub fn caller_should_release(&self) -> bool {
        matches!(self, RingRecord::Owned(_))
    }
}

/// Reads one record at `abs_offset` (relative to the ring's current `head`). Returns
/// `Err(EndOfStream)` once the translated position reaches `tail`. On success, returns the
/// record and the `abs_offset` to pass on the next call.
pub fn read_at(
    head: u32,
    tail: u32,
    ring_bytes: &[u8],
    abs_offset: u32,
) -> Result<(RingRecord, u32)> {
    let capacity = ring_bytes.len() as u32;
    let cyclic_offset = (head + abs_offset) % capacity;
    if cyclic_offset == tail {
        return Err(Error::EndOfStream);
    }

    let aligned_len = read_u32_ro(ring_bytes, cyclic_offset);
    let payload_start = (cyclic_offset + 4) % capacity;
    let framed = read_wrapping_ro(ring_bytes, payload_start, aligned_len);

    let actual_len = framed.iter().position(|&b| b == 0).unwrap_or(framed.len());
    let wraps = (payload_start as u64 + aligned_len as u64) > capacity as u64;

    let record = if wraps {
        RingRecord::Owned(framed[..actual_len].to_vec())
    } else {
        RingRecord::Borrowed(framed[..actual_len].to_vec())
    };

    Ok((record, abs_offset + aligned_len + 4))
}

fn read_wrapping_ro(bytes: &[u8], at: u32, len: u32) -> Vec<u8> {
    let cap = bytes.len() as u32;
    let start = at % cap;
    let mut out = vec![0u8; len as usize];
    let first = (cap - start).min(len) as usize;
    out[..first].copy_from_slice(&bytes[start as usize..start as usize + first]);
    if first < len as usize {
        out[first..].copy_from_slice(&bytes[..len as usize - first]);
    }
    out
}

fn read_u32_ro(bytes: &[u8], at: u32) -> u32 {
    let b = read_wrapping_ro(bytes, at, 4);
    u32::from_le_bytes(b.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_evicts_oldest_whole_records() {
        let head = AtomicU32::new(0);
        let tail = AtomicU32::new(0);
        let count = AtomicU32::new(0);
        let mut ring = vec![0u8; 64];

        write(&head, &tail, &count, &mut ring, &[1u8; 20]).unwrap();
        write(&head, &tail, &count, &mut ring, &[2u8; 20]).unwrap();
        write(&head, &tail, &count, &mut ring, &[3u8; 20]).unwrap();

        assert_eq!(count.load(Ordering::Acquire), 2);
        // Eviction steps head past record 1's whole entry: old_len = align_up(20+1,4) = 24,
        // entry length = old_len+4 = 28, so head lands at 0+28 = 28.
        assert_eq!(head.load(Ordering::Acquire), 28);
    }

    #[test]
    fn round_trip_without_wrap() {
        let head = AtomicU32::new(0);
        let tail = AtomicU32::new(0);
        let count = AtomicU32::new(0);
        let mut ring = vec![0u8; 64];
        write(&head, &tail, &count, &mut ring, b"hello").unwrap();

        let (rec, next) = read_at(0, tail.load(Ordering::Acquire), &ring, 0).unwrap();
        assert_eq!(rec.bytes(), b"hello");
        assert!(!rec.caller_should_release());
        assert_eq!(next, tail.load(Ordering::Acquire));
    }
}
