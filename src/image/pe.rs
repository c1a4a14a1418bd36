//! PE/PE32+ image reader.
//!
//! Like [`super::elf::ElfImageReader`], header/section/COFF-symbol decoding is delegated to
//! `object`; this module supplies the source-file attribution and the zero-size fix-up.
//!
//! The function-size inference for static COFF symbols (an aux record following a section-local
//! symbol supplies a "speculative" size) is best-effort: when it disagrees with the
//! next-symbol/section-end heuristic, the latter wins. This mirrors the open question the
//! original implementation leaves unresolved.

use super::section::{Section, SectionDirectory};
use super::symbol::{self, SymbolRecord};
use super::{ImageReader, SymbolLookup};
use crate::error::{Error, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::path::PathBuf;

pub struct PeImageReader {
    path: PathBuf,
    image_base: u64,
    module_load_address: u64,
    sections: SectionDirectory,
    symbols: Vec<SymbolRecord>,
    source_files: Vec<String>,
}

impl PeImageReader {
    pub fn parse(path: PathBuf, data: Vec<u8>, module_load_address: u64) -> Result<Self> {
        let obj = object::File::parse(&*data).map_err(Error::ObjParsing)?;

        if !obj.is_little_endian() {
            return Err(Error::NotImplemented("big-endian PE"));
        }

        if !matches!(obj, object::File::Pe32(_) | object::File::Pe64(_)) {
            return Err(Error::NotImplemented("not a PE image"));
        }
        let image_base = obj.relative_address_base();

        let mut sections = super::build_section_directory_from_object(&obj);
        for section in obj.sections() {
            let name = match section.name() {
                Ok(n) if !n.is_empty() => n.to_string(),
                _ => continue,
            };
            if let Ok(bytes) = section.data() {
                if let Some(s) = sections.get_mut(&name) {
                    s.materialize(bytes.to_vec());
                }
            }
        }

        let (symbols, source_files) = Self::collect_symbols(&obj);

        Ok(Self {
            path,
            image_base,
            module_load_address,
            sections,
            symbols,
            source_files,
        })
    }

    fn collect_symbols(obj: &object::File) -> (Vec<SymbolRecord>, Vec<String>) {
        let mut source_files = Vec::new();
        let mut current_file_index: Option<usize> = None;
        let mut records = Vec::new();
        // Speculative per-section function-size map, populated from static null-typed COFF
        // symbols with an aux record. Disagreement with the next-symbol heuristic is resolved in
        // favor of the heuristic, per the PE section in the design notes.
        let mut size_hints: HashMap<(usize, u64), u64> = HashMap::new();

        for sym in obj.symbols() {
            if sym.is_undefined() {
                continue;
            }
            let section_index = sym.section_index().map(|s| s.0).unwrap_or(0);
            match sym.kind() {
                SymbolKind::File => {
                    if let Ok(name) = sym.name() {
                        source_files.push(name.to_string());
                        current_file_index = Some(source_files.len() - 1);
                    }
                }
                SymbolKind::Section | SymbolKind::Data if sym.size() > 0 => {
                    size_hints.insert((section_index, sym.address()), sym.size());
                }
                SymbolKind::Text => {
                    let name = sym.name().unwrap_or("").to_string();
                    if name.is_empty() {
                        continue;
                    }
                    let size = if sym.size() != 0 {
                        sym.size()
                    } else {
                        size_hints
                            .get(&(section_index, sym.address()))
                            .copied()
                            .unwrap_or(0)
                    };
                    records.push(SymbolRecord {
                        offset: sym.address(),
                        size,
                        name,
                        source_file_index: current_file_index,
                        origin_section_index: section_index,
                    });
                }
                _ => {}
            }
        }

        // `fixup_zero_sized` walks forward from each symbol to find the next one in the same
        // section, so the vector must already be address-ordered before it runs (COFF symbol
        // table order is not necessarily address order).
        records.sort_by_key(|s| s.offset);
        let section_ends: HashMap<usize, u64> = obj
            .sections()
            .map(|s| (s.index().0, s.address() + s.size()))
            .collect();
        symbol::fixup_zero_sized(&mut records, |idx| section_ends.get(&idx).copied());

        (super::finalize_symbols(records), source_files)
    }
}

impl ImageReader for PeImageReader {
    fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn module_load_address(&self) -> u64 {
        self.module_load_address
    }

    fn search_symbol(&self, addr: u64) -> Result<SymbolLookup> {
        let sym = symbol::search(&self.symbols, addr).ok_or(Error::NotFound)?;
        Ok(SymbolLookup {
            name: sym.name.clone(),
            source_file: sym
                .source_file_index
                .and_then(|i| self.source_files.get(i))
                .cloned(),
            start_addr: sym.offset,
        })
    }

    fn get_section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    fn for_each_section(&self, prefix: &str, visitor: &mut dyn FnMut(&Section)) {
        self.sections.for_each(prefix, visitor)
    }

    fn relocation_base(&self) -> u64 {
        self.image_base
    }
}
