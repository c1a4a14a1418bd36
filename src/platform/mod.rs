//! Platform module-enumeration glue: the only OS-specific surface the module manager depends on.
//! Out of scope for the core design beyond this interface; Linux is implemented via `proc-maps`,
//! Windows is stubbed pending an equivalent `EnumProcessModules` walk.

use crate::error::{Error, Result};
use crate::module::ModuleDescriptor;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as imp;

#[cfg(not(target_os = "linux"))]
mod stub;
#[cfg(not(target_os = "linux"))]
use stub as imp;

pub fn enumerate_modules() -> Result<Vec<ModuleDescriptor>> {
    imp::enumerate_modules()
}

pub fn module_containing(addr: u64) -> Result<ModuleDescriptor> {
    enumerate_modules()?
        .into_iter()
        .find(|m| m.contains(addr))
        .ok_or(Error::NotFound)
}

pub fn main_module() -> Result<ModuleDescriptor> {
    imp::main_module()
}
