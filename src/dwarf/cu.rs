//! Compilation-unit summary: the handful of attributes the line engine and the lookup path need,
//! read once per CU and cached by [`super::DwarfResolver`].

use super::R;
use crate::error::{Error, Result};
use gimli::{DebugInfoOffset, DebugLineOffset};

#[derive(Debug, Clone)]
pub struct CuSummary {
    pub name: Option<String>,
    pub line_program_offset: Option<DebugLineOffset>,
    pub base_address: u64,
    pub range_low: u64,
    pub range_high: u64,
}

pub fn read_unit(dwarf: &gimli::Dwarf<R>, offset: DebugInfoOffset) -> Result<gimli::Unit<R>> {
    let header = dwarf
        .debug_info
        .header_from_offset(offset)
        .map_err(Error::DwarfParsing)?;

    if header.version() != 3 && header.version() != 5 {
        return Err(Error::NotImplemented("DWARF version other than 3 or 5"));
    }

    let unit = dwarf.unit(header).map_err(Error::DwarfParsing)?;

    if unit.header.type_() != gimli::UnitType::Compilation {
        return Err(Error::DataCorrupt(
            "top-level DIE is not DW_TAG_compile_unit".into(),
        ));
    }
    Ok(unit)
}

pub fn summarize(dwarf: &gimli::Dwarf<R>, unit: &gimli::Unit<R>) -> Result<CuSummary> {
    let mut entries = unit.entries();
    let root = entries
        .next_dfs()
        .map_err(Error::DwarfParsing)?
        .ok_or_else(|| Error::DataCorrupt("compilation unit has no root DIE".into()))?
        .1;

    let name = match root.attr_value(gimli::DW_AT_name)? {
        Some(attr) => dwarf
            .attr_string(unit, attr)
            .ok()
            .map(|s| s.to_string_lossy().into_owned()),
        None => None,
    };

    let low_pc = match root.attr_value(gimli::DW_AT_low_pc)? {
        Some(gimli::AttributeValue::Addr(a)) => a,
        _ => 0,
    };

    let mut range_low = low_pc;
    let mut range_high = low_pc;

    let mut saw_range = false;
    if let Some(high_pc_attr) = root.attr_value(gimli::DW_AT_high_pc)? {
        let high = match high_pc_attr {
            gimli::AttributeValue::Addr(a) => a,
            gimli::AttributeValue::Udata(delta) => low_pc + delta,
            _ => low_pc,
        };
        range_high = high;
        saw_range = true;
    }

    if let Some(ranges_attr) = root.attr_value(gimli::DW_AT_ranges)? {
        if let Ok(Some(offset)) = dwarf.attr_ranges_offset(unit, ranges_attr) {
            let mut iter = dwarf.ranges(unit, offset).map_err(Error::DwarfParsing)?;
            let mut lo = u64::MAX;
            let mut hi = 0u64;
            while let Some(range) = iter.next().map_err(Error::DwarfParsing)? {
                lo = lo.min(range.begin);
                hi = hi.max(range.end);
            }
            if hi > lo {
                range_low = lo;
                range_high = hi;
                saw_range = true;
            }
        }
    }

    if !saw_range {
        range_low = 0;
        range_high = 0;
    }

    Ok(CuSummary {
        name,
        line_program_offset: unit.line_program.as_ref().map(|lp| lp.header().offset()),
        base_address: low_pc,
        range_low,
        range_high,
    })
}
