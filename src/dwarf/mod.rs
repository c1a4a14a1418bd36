//! DWARF v5 resolver: maps a runtime address to `{file, line, column}`.
//!
//! The heavy lifting of decoding abbreviations, DIE attributes, range lists and line programs
//! is delegated to `gimli` (the encoding is exactly the state machine the design describes); this
//! module supplies the domain-specific assembly on top: the `.debug_aranges` interval map, the
//! compilation-unit summary cache, the sorted per-CU line matrix and the combined lookup.

pub mod aranges;
pub mod cu;
pub mod line;

use crate::error::{Error, Result};
use gimli::LittleEndian;
use std::collections::HashMap;
use std::sync::Arc;

/// `gimli`'s reader type for this module. Backed by `Arc<[u8]>` rather than a borrowed slice: a
/// `DwarfResolver` is built from sections owned by an image reader but must itself outlive no
/// particular borrow of it (it's looked up from a different thread than the one that opened the
/// image), so the reader owns a ref-counted handle to each section's bytes instead of a lifetime.
pub type R = gimli::EndianReader<LittleEndian, Arc<[u8]>>;

/// The eight named DWARF sections. The first seven must be present before the resolver opens;
/// `.debug_addr` is optional (only consulted for `DW_AT_addr_base`-relative forms).
#[derive(Default, Clone)]
pub struct DwarfSections {
    pub debug_info: Option<Arc<[u8]>>,
    pub debug_aranges: Option<Arc<[u8]>>,
    pub debug_line: Option<Arc<[u8]>>,
    pub debug_str: Option<Arc<[u8]>>,
    pub debug_line_str: Option<Arc<[u8]>>,
    pub debug_abbrev: Option<Arc<[u8]>>,
    pub debug_rnglists: Option<Arc<[u8]>>,
    pub debug_addr: Option<Arc<[u8]>>,
}

const REQUIRED: &[&str] = &[
    ".debug_info",
    ".debug_aranges",
    ".debug_line",
    ".debug_str",
    ".debug_line_str",
    ".debug_abbrev",
    ".debug_rnglists",
];

fn empty() -> Arc<[u8]> {
    Arc::from(Vec::new().into_boxed_slice())
}

impl DwarfSections {
    pub fn has_required(&self) -> bool {
        self.debug_info.is_some()
            && self.debug_aranges.is_some()
            && self.debug_line.is_some()
            && self.debug_str.is_some()
            && self.debug_line_str.is_some()
            && self.debug_abbrev.is_some()
            && self.debug_rnglists.is_some()
    }

    pub fn required_names() -> &'static [&'static str] {
        REQUIRED
    }

    fn reader(&self, data: &Option<Arc<[u8]>>) -> R {
        gimli::EndianReader::new(data.clone().unwrap_or_else(empty), LittleEndian)
    }

    pub fn gimli_dwarf(&self) -> gimli::Dwarf<R> {
        gimli::Dwarf {
            debug_abbrev: gimli::DebugAbbrev::from(self.reader(&self.debug_abbrev)),
            debug_addr: gimli::DebugAddr::from(self.reader(&self.debug_addr)),
            debug_aranges: gimli::DebugAranges::from(self.reader(&self.debug_aranges)),
            debug_info: gimli::DebugInfo::from(self.reader(&self.debug_info)),
            debug_line: gimli::DebugLine::from(self.reader(&self.debug_line)),
            debug_line_str: gimli::DebugLineStr::from(self.reader(&self.debug_line_str)),
            debug_str: gimli::DebugStr::from(self.reader(&self.debug_str)),
            debug_str_offsets: gimli::DebugStrOffsets::from(self.reader(&None)),
            debug_types: gimli::DebugTypes::from(self.reader(&None)),
            locations: gimli::LocationLists::new(
                gimli::DebugLoc::from(self.reader(&None)),
                gimli::DebugLocLists::from(self.reader(&None)),
            ),
            ranges: gimli::RangeLists::new(
                gimli::DebugRanges::from(self.reader(&None)),
                gimli::DebugRngLists::from(self.reader(&self.debug_rnglists)),
            ),
            file_type: gimli::DwarfFileType::Main,
            sup: None,
            abbreviations_cache: gimli::AbbreviationsCache::new(),
        }
    }
}

/// Resolved `{file, line, column}` for a single address. The symbol's display name is not
/// resolved here: the image reader's symbol table is the authoritative source for it (see
/// [`crate::symbol_engine`]).
#[derive(Debug, Clone, Default)]
pub struct ResolvedLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

struct CuEntry {
    #[allow(dead_code)]
    summary: cu::CuSummary,
    matrix: line::LineMatrix,
}

/// Per-module DWARF resolver: the address-range multimap plus a CU summary/line-matrix cache
/// built lazily, one CU at a time, the first time an address in it is queried.
pub struct DwarfResolver {
    sections: DwarfSections,
    dwarf: gimli::Dwarf<R>,
    arange_map: aranges::AddressRangeMap,
    cu_cache: HashMap<gimli::DebugInfoOffset, CuEntry>,
}

impl DwarfResolver {
    pub fn open(sections: DwarfSections) -> Result<Self> {
        if !sections.has_required() {
            return Err(Error::NotFound);
        }
        let dwarf = sections.gimli_dwarf();
        let arange_map = aranges::build(sections.debug_aranges.as_deref().unwrap())?;
        Ok(Self {
            sections,
            dwarf,
            arange_map,
            cu_cache: HashMap::new(),
        })
    }

    /// Resolves `relocated_address` (already translated into the debug-info address space).
    pub fn resolve(&mut self, relocated_address: u64) -> Result<ResolvedLocation> {
        let cu_offset = self
            .arange_map
            .lookup(relocated_address)
            .ok_or(Error::NotFound)?;

        if !self.cu_cache.contains_key(&cu_offset) {
            let unit = cu::read_unit(&self.dwarf, cu_offset)?;
            let summary = cu::summarize(&self.dwarf, &unit)?;
            let matrix = line::build(&self.dwarf, &unit, &summary)?;
            self.cu_cache.insert(cu_offset, CuEntry { summary, matrix });
        }
        let entry = self.cu_cache.get(&cu_offset).expect("just inserted");

        let row = entry.matrix.lookup(relocated_address)?;
        let file = entry
            .matrix
            .file(row.file_index)
            .map(|p| p.to_string_lossy().into_owned());
        Ok(ResolvedLocation {
            file,
            line: Some(row.line as u32),
            column: Some(row.column as u32),
        })
    }

    pub fn sections(&self) -> &DwarfSections {
        &self.sections
    }
}
