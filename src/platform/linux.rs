//! Linux module enumeration via `/proc/<pid>/maps`, merged into one descriptor per distinct
//! backing file (a shared object is usually mapped in several discontiguous, differently
//! permissioned regions; the library only needs the overall `[load_address, load_address+size)`
//! span for symbol-engine lookups).

use crate::error::{Error, Result};
use crate::module::ModuleDescriptor;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub fn enumerate_modules() -> Result<Vec<ModuleDescriptor>> {
    let pid = std::process::id() as proc_maps::Pid;
    let maps = proc_maps::get_process_maps(pid).map_err(Error::SystemFailure)?;

    let mut spans: BTreeMap<PathBuf, (u64, u64)> = BTreeMap::new();
    for region in maps {
        let Some(path) = region.filename().as_ref() else {
            continue;
        };
        let lo = region.start() as u64;
        let hi = lo + region.size() as u64;
        spans
            .entry(path.to_path_buf())
            .and_modify(|(l, h)| {
                *l = (*l).min(lo);
                *h = (*h).max(hi);
            })
            .or_insert((lo, hi));
    }

    let mut modules: Vec<ModuleDescriptor> = spans
        .into_iter()
        .map(|(path, (lo, hi))| ModuleDescriptor {
            path,
            load_address: lo,
            size_bytes: hi - lo,
        })
        .collect();
    modules.sort_by_key(|m| m.load_address);
    Ok(modules)
}

pub fn main_module() -> Result<ModuleDescriptor> {
    let exe = std::env::current_exe().map_err(Error::SystemFailure)?;
    enumerate_modules()?
        .into_iter()
        .find(|m| m.path == exe)
        .ok_or(Error::NotFound)
}
