//! Binary image reader: parses ELF (32/64) and PE/PE32+ object files to extract section
//! tables, symbol tables and per-symbol source-file attribution.

pub mod elf;
pub mod pe;
pub mod section;
pub mod symbol;

use crate::error::{Error, Result};
use section::{Section, SectionDirectory};
use std::path::Path;
use symbol::SymbolRecord;

/// Result of a successful symbol lookup: `(name, source_file, symbol_start_address)`.
#[derive(Debug, Clone)]
pub struct SymbolLookup {
    pub name: String,
    pub source_file: Option<String>,
    pub start_addr: u64,
}

/// Common contract implemented by [`elf::ElfImageReader`] and [`pe::PeImageReader`].
///
/// `search_symbol` returns [`Error::NotFound`] when `addr` falls in a gap between symbols.
pub trait ImageReader: Send + Sync {
    fn path(&self) -> &Path;

    fn module_load_address(&self) -> u64;

    /// Module-relative `addr` (i.e. `runtime_addr - module_load_address`) owning symbol lookup.
    fn search_symbol(&self, addr: u64) -> Result<SymbolLookup>;

    fn get_section(&self, name: &str) -> Option<&Section>;

    fn for_each_section(&self, prefix: &str, visitor: &mut dyn FnMut(&Section));

    /// Relocation base the embedded debug info was prepared against (usually 0 for PIE-relative
    /// DWARF, or `module_load_address` when the reader wants callers to add it back in).
    fn relocation_base(&self) -> u64;
}

/// Sniffs the first bytes of `path` and opens the matching concrete reader.
///
/// The whole file is pulled through [`crate::reader::BufferedFileReader`] rather than
/// `std::fs::read` directly, and the magic-number check is done against that same buffer through
/// a [`crate::reader::FixedBufferStream`] cursor instead of raw slice indexing.
pub fn open(path: &Path, module_load_address: u64) -> Result<Box<dyn ImageReader>> {
    let mut file_reader = crate::reader::BufferedFileReader::open(path)?;
    let data = file_reader.read_bytes(file_reader.len() as usize)?;

    let mut sniff = crate::reader::FixedBufferStream::new(&data);
    let is_elf = sniff.read_bytes(4).map(|b| b == b"\x7fELF").unwrap_or(false);
    sniff.seek(0)?;
    let is_pe = sniff.read_bytes(2).map(|b| b == b"MZ").unwrap_or(false);

    if is_elf {
        Ok(Box::new(elf::ElfImageReader::parse(
            path.to_path_buf(),
            data,
            module_load_address,
        )?))
    } else if is_pe {
        Ok(Box::new(pe::PeImageReader::parse(
            path.to_path_buf(),
            data,
            module_load_address,
        )?))
    } else {
        Err(Error::NotImplemented("unrecognized image format"))
    }
}

pub(crate) fn build_section_directory_from_object(obj: &object::File) -> SectionDirectory {
    use object::{Object, ObjectSection};
    let mut dir = SectionDirectory::new();
    for section in obj.sections() {
        let name = section.name().unwrap_or("").to_string();
        if name.is_empty() {
            continue;
        }
        dir.insert(Section::new(
            name,
            section.file_range().map(|(off, _)| off).unwrap_or(0),
            section.size(),
        ));
    }
    dir
}

/// Sorts `symbols` by `offset` and asserts the no-overlap invariant holds afterwards.
pub(crate) fn finalize_symbols(mut symbols: Vec<SymbolRecord>) -> Vec<SymbolRecord> {
    symbols.sort_by_key(|s| s.offset);
    symbols
}
