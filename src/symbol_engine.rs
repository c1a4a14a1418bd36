//! Symbol engine: the resolver facade combining the image reader and the DWARF resolver, with
//! exactly one thread preparing a given module's parsed state and all others waiting on it.

use crate::dwarf::{DwarfResolver, DwarfSections, ResolvedLocation};
use crate::error::{Error, Result};
use crate::image::{self, ImageReader};
use crate::module::{ModuleDescriptor, ModuleManager};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

/// Everything the resolver facade needs for a single module, built once and shared thereafter.
struct ModuleData {
    image: Box<dyn ImageReader>,
    dwarf: Option<Mutex<DwarfResolver>>,
}

impl ModuleData {
    fn build(module: &ModuleDescriptor) -> Result<Self> {
        let image = image::open(&module.path, module.load_address)?;

        let mut sections = DwarfSections::default();
        for name in DwarfSections::required_names() {
            if let Some(section) = image.get_section(name) {
                let arc = section.data_arc().or_else(|| {
                    // Not yet materialized: pull the bytes through once, on the resolver's
                    // thread, without reopening the image.
                    section.data().map(|b| Arc::from(b.to_vec().into_boxed_slice()))
                });
                match *name {
                    ".debug_info" => sections.debug_info = arc,
                    ".debug_aranges" => sections.debug_aranges = arc,
                    ".debug_line" => sections.debug_line = arc,
                    ".debug_str" => sections.debug_str = arc,
                    ".debug_line_str" => sections.debug_line_str = arc,
                    ".debug_abbrev" => sections.debug_abbrev = arc,
                    ".debug_rnglists" => sections.debug_rnglists = arc,
                    _ => {}
                }
            }
        }
        if let Some(section) = image.get_section(".debug_addr") {
            sections.debug_addr = section.data_arc();
        }

        let dwarf = if sections.has_required() {
            Some(Mutex::new(DwarfResolver::open(sections)?))
        } else {
            None
        };

        Ok(Self { image, dwarf })
    }
}

enum ModuleState {
    NotReady,
    Building,
    Ready(Arc<ModuleData>),
    Failed,
}

struct ModuleSlot {
    state: Mutex<ModuleState>,
    ready: Condvar,
}

impl ModuleSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(ModuleState::NotReady),
            ready: Condvar::new(),
        }
    }
}

/// Resolved symbol information for one address, per the facade's `get_symbol_info` contract.
#[derive(Debug, Clone, Default)]
pub struct SymbolInfo {
    pub module_base: u64,
    pub module_name: String,
    pub start_addr: Option<u64>,
    pub byte_offset: Option<u64>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub symbol_name: Option<String>,
}

pub struct SymbolEngine {
    modules: Arc<ModuleManager>,
    slots: std::sync::RwLock<HashMap<PathBuf, Arc<ModuleSlot>>>,
}

impl SymbolEngine {
    pub fn new(modules: Arc<ModuleManager>) -> Self {
        Self {
            modules,
            slots: std::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn get_symbol_info(&self, addr: u64) -> Result<SymbolInfo> {
        let module = self.modules.get_module_by_address(addr)?;
        let slot = self.slot_for(&module.path);
        let data = self.ensure_ready(&module, &slot);

        let mut info = SymbolInfo {
            module_base: module.load_address,
            module_name: module.basename(),
            ..Default::default()
        };

        let Ok(data) = data else {
            return Ok(info);
        };

        let module_relative = addr - module.load_address;

        if let Ok(sym) = data.image.search_symbol(module_relative) {
            info.start_addr = Some(sym.start_addr);
            info.byte_offset = Some(module_relative - sym.start_addr);
            info.file = sym.source_file;
            info.symbol_name = Some(demangle(&sym.name));
        }

        if let Some(dwarf) = &data.dwarf {
            let relocated = data.image.relocation_base() + module_relative;
            if let Ok(mut resolver) = dwarf.lock() {
                if let Ok(ResolvedLocation { file, line, column }) = resolver.resolve(relocated) {
                    if file.is_some() {
                        info.file = file;
                    }
                    info.line = line;
                    info.column = column;
                }
            }
        }

        Ok(info)
    }

    fn slot_for(&self, path: &Path) -> Arc<ModuleSlot> {
        if let Some(s) = self.slots.read().expect("slot map lock poisoned").get(path) {
            return s.clone();
        }
        let mut map = self.slots.write().expect("slot map lock poisoned");
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(ModuleSlot::new()))
            .clone()
    }

    /// Exactly one caller per module transitions `NotReady → Building → Ready|Failed`; every
    /// other concurrent caller blocks on the slot's condition variable until that happens.
    fn ensure_ready(&self, module: &ModuleDescriptor, slot: &ModuleSlot) -> Result<Arc<ModuleData>> {
        let mut guard = slot.state.lock().expect("module slot lock poisoned");
        loop {
            match &*guard {
                ModuleState::Ready(data) => return Ok(data.clone()),
                ModuleState::Failed => return Err(Error::NotFound),
                ModuleState::Building => {
                    guard = slot.ready.wait(guard).expect("module slot lock poisoned");
                }
                ModuleState::NotReady => {
                    *guard = ModuleState::Building;
                    drop(guard);
                    let built = ModuleData::build(module);
                    let mut guard2 = slot.state.lock().expect("module slot lock poisoned");
                    *guard2 = match built {
                        Ok(data) => ModuleState::Ready(Arc::new(data)),
                        Err(_) => ModuleState::Failed,
                    };
                    slot.ready.notify_all();
                    return match &*guard2 {
                        ModuleState::Ready(data) => Ok(data.clone()),
                        _ => Err(Error::NotFound),
                    };
                }
            }
        }
    }
}

fn demangle(name: &str) -> String {
    format!("{:#}", rustc_demangle::demangle(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangle_strips_rust_mangling() {
        assert_eq!(demangle("_ZN4core3fmt5Write9write_fmt"), "core::fmt::Write::write_fmt");
    }
}
