//! Module manager: an interval-sorted set of loaded binary images, looked up by address or by
//! name and refreshed from the platform's module-enumeration glue.

use crate::error::{Error, Result};
use crate::platform;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// `(path, load_address, size_bytes)`. `contains(addr)` uses the half-open interval
/// `[load_address, load_address+size)`.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub path: PathBuf,
    pub load_address: u64,
    pub size_bytes: u64,
}

impl ModuleDescriptor {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.load_address && addr < self.load_address + self.size_bytes
    }

    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Process-wide set of loaded modules, ordered by `load_address`.
///
/// Insert races are idempotent: the first writer to land a module at a given address wins, and a
/// losing writer silently adopts the winner's descriptor rather than erroring.
pub struct ModuleManager {
    modules: RwLock<Vec<ModuleDescriptor>>,
    main_module: RwLock<Option<ModuleDescriptor>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
            main_module: RwLock::new(None),
        }
    }

    fn insert_sorted(modules: &mut Vec<ModuleDescriptor>, descriptor: ModuleDescriptor) {
        match modules.binary_search_by_key(&descriptor.load_address, |m| m.load_address) {
            Ok(_) => {}
            Err(idx) => modules.insert(idx, descriptor),
        }
    }

    /// Looks up the module owning `addr`. On a miss, asks the platform to enumerate the single
    /// module that covers it and inserts it; a concurrent racing insert converges on the first
    /// writer's copy.
    pub fn get_module_by_address(&self, addr: u64) -> Result<ModuleDescriptor> {
        {
            let modules = self.modules.read().expect("module set lock poisoned");
            if let Some(m) = find_containing(&modules, addr) {
                return Ok(m.clone());
            }
        }

        let discovered = platform::module_containing(addr)?;

        let mut modules = self.modules.write().expect("module set lock poisoned");
        if let Some(m) = find_containing(&modules, addr) {
            return Ok(m.clone());
        }
        Self::insert_sorted(&mut modules, discovered.clone());
        Ok(discovered)
    }

    /// Linear scan for a module whose path contains `substring`. When `refresh` is set, the
    /// module list is fully re-enumerated from the platform before scanning.
    pub fn get_module_by_name(&self, substring: &str, refresh: bool) -> Result<ModuleDescriptor> {
        if refresh {
            self.refresh_module_list()?;
        }
        let modules = self.modules.read().expect("module set lock poisoned");
        modules
            .iter()
            .find(|m| m.path.to_string_lossy().contains(substring))
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// The module containing the process entry point, cached on first lookup.
    pub fn get_main_module(&self) -> Result<ModuleDescriptor> {
        if let Some(m) = self.main_module.read().expect("main module lock poisoned").clone() {
            return Ok(m);
        }
        let main = platform::main_module()?;
        *self.main_module.write().expect("main module lock poisoned") = Some(main.clone());
        Ok(main)
    }

    pub fn for_each_module(&self, mut visitor: impl FnMut(&ModuleDescriptor)) {
        let modules = self.modules.read().expect("module set lock poisoned");
        for m in modules.iter() {
            visitor(m);
        }
    }

    /// Replaces the module set atomically with a fresh platform enumeration.
    pub fn refresh_module_list(&self) -> Result<()> {
        let mut fresh = platform::enumerate_modules()?;
        fresh.sort_by_key(|m| m.load_address);
        *self.modules.write().expect("module set lock poisoned") = fresh;
        Ok(())
    }

    pub fn path_of(&self, addr: u64) -> Option<PathBuf> {
        self.modules
            .read()
            .expect("module set lock poisoned")
            .iter()
            .find(|m| m.contains(addr))
            .map(|m| m.path.clone())
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

fn find_containing(modules: &[ModuleDescriptor], addr: u64) -> Option<&ModuleDescriptor> {
    let idx = modules.partition_point(|m| m.load_address <= addr);
    if idx == 0 {
        return None;
    }
    let candidate = &modules[idx - 1];
    candidate.contains(addr).then_some(candidate)
}

pub fn is_loaded(modules: &[ModuleDescriptor], path: &Path) -> bool {
    modules.iter().any(|m| m.path == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(addr: u64, size: u64) -> ModuleDescriptor {
        ModuleDescriptor {
            path: PathBuf::from(format!("/lib/mod_{addr:x}.so")),
            load_address: addr,
            size_bytes: size,
        }
    }

    #[test]
    fn find_containing_hits_and_misses() {
        let modules = vec![d(0x1000, 0x100), d(0x2000, 0x200)];
        assert!(find_containing(&modules, 0x1050).is_some());
        assert!(find_containing(&modules, 0x1100).is_none());
        assert!(find_containing(&modules, 0x2150).is_some());
        assert!(find_containing(&modules, 0x500).is_none());
    }

    #[test]
    fn insert_sorted_keeps_order() {
        let mut modules = vec![d(0x1000, 0x100)];
        ModuleManager::insert_sorted(&mut modules, d(0x500, 0x100));
        ModuleManager::insert_sorted(&mut modules, d(0x2000, 0x100));
        let addrs: Vec<u64> = modules.iter().map(|m| m.load_address).collect();
        assert_eq!(addrs, vec![0x500, 0x1000, 0x2000]);
    }
}
