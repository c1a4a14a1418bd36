//! Context area: an append-only, length-prefixed record stream shared by the whole process,
//! written through a single atomic cursor. Writers never block each other and never wrap; a full
//! area rejects the write and rolls the cursor back rather than overwriting anything.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicI32, Ordering};

const LEN_PREFIX_BYTES: i32 = 4;

/// Appends `payload` to the context area. Returns the byte offset it was written at.
pub fn write(write_pos: &AtomicI32, area: &mut [u8], payload: &[u8]) -> Result<i32> {
    let entry_len = payload.len() as i32 + LEN_PREFIX_BYTES;
    let area_size = area.len() as i32;

    let reserved = write_pos.fetch_add(entry_len, Ordering::AcqRel);
    if reserved + entry_len > area_size {
        write_pos.fetch_add(-entry_len, Ordering::AcqRel);
        return Err(Error::ResourceLimit("context area full"));
    }

    let at = reserved as usize;
    area[at..at + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    area[at + 4..at + 4 + payload.len()].copy_from_slice(payload);
    Ok(reserved)
}

/// Sequentially reads every record from offset 0 up to the observed write cursor. A header whose
/// declared length would run past `up_to` is reported as data corruption rather than read.
pub fn read_all(area: &[u8], up_to: i32) -> Result<Vec<Vec<u8>>> {
    let up_to = up_to.max(0) as usize;
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < up_to {
        if offset + 4 > area.len() {
            return Err(Error::DataCorrupt("context record length prefix truncated".into()));
        }
        let len = u32::from_le_bytes(area[offset..offset + 4].try_into().unwrap()) as usize;
        let start = offset + 4;
        let end = start + len;
        if end > up_to || end > area.len() {
            return Err(Error::DataCorrupt("context record payload exceeds cursor".into()));
        }
        records.push(area[start..end].to_vec());
        offset = end;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_on_overflow_leaves_cursor_unchanged() {
        let cursor = AtomicI32::new(0);
        let mut area = vec![0u8; 64];

        write(&cursor, &mut area, &[0u8; 20]).unwrap();
        write(&cursor, &mut area, &[0u8; 20]).unwrap();
        assert_eq!(cursor.load(Ordering::Acquire), 48);

        let err = write(&cursor, &mut area, &[0u8; 20]).unwrap_err();
        assert!(matches!(err, Error::ResourceLimit(_)));
        assert_eq!(cursor.load(Ordering::Acquire), 48);
    }

    #[test]
    fn round_trip_matches_write_order() {
        let cursor = AtomicI32::new(0);
        let mut area = vec![0u8; 64];
        write(&cursor, &mut area, b"abc").unwrap();
        write(&cursor, &mut area, b"de").unwrap();
        let read = read_all(&area, cursor.load(Ordering::Acquire)).unwrap();
        assert_eq!(read, vec![b"abc".to_vec(), b"de".to_vec()]);
    }
}
