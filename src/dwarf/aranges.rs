//! `.debug_aranges` address-range multimap: `[lo, hi)` intervals tagged with the owning CU's
//! `.debug_info` offset, ordered by `lo` for lower-bound lookup.

use crate::error::{Error, Result};
use gimli::DebugInfoOffset;

#[derive(Debug, Clone, Copy)]
struct Interval {
    lo: u64,
    hi: u64,
    cu: DebugInfoOffset,
}

/// Ordered-by-`lo` interval list. Multiple CUs may contribute identical ranges (rare, but the
/// design tolerates it): the map keeps the first CU that claimed an address.
#[derive(Default)]
pub struct AddressRangeMap {
    intervals: Vec<Interval>,
}

impl AddressRangeMap {
    pub fn lookup(&self, addr: u64) -> Option<DebugInfoOffset> {
        let idx = match self.intervals.binary_search_by(|i| i.lo.cmp(&addr)) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        // `lo`s can repeat for degenerate zero-length ranges; scan forward defensively but the
        // common case is a single hit at `idx`.
        for i in &self.intervals[idx..] {
            if i.lo > addr {
                break;
            }
            if addr >= i.lo && addr < i.hi {
                return Some(i.cu);
            }
        }
        None
    }
}

pub fn build(debug_aranges: &[u8]) -> Result<AddressRangeMap> {
    let aranges = gimli::DebugAranges::new(debug_aranges, gimli::LittleEndian);
    let mut intervals = Vec::new();

    let mut headers = aranges.headers();
    while let Some(header) = headers.next().map_err(Error::DwarfParsing)? {
        if header.segment_size() != 0 {
            // Segmented addressing is not part of the supported x86/x86_64 targets.
            continue;
        }
        let cu_offset = header.debug_info_offset();

        let mut entries = header.entries();
        while let Some(entry) = entries.next().map_err(Error::DwarfParsing)? {
            if entry.length() == 0 {
                continue;
            }
            intervals.push(Interval {
                lo: entry.address(),
                hi: entry.address() + entry.length(),
                cu: cu_offset,
            });
        }
    }

    intervals.sort_by_key(|i| i.lo);
    Ok(AddressRangeMap { intervals })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_outside_any_interval() {
        let map = AddressRangeMap {
            intervals: vec![Interval {
                lo: 0x400000,
                hi: 0x401000,
                cu: DebugInfoOffset(0),
            }],
        };
        assert!(map.lookup(0x399000).is_none());
        assert!(map.lookup(0x401000).is_none());
        assert_eq!(map.lookup(0x400100).unwrap(), DebugInfoOffset(0));
    }
}
