//! Non-Linux module enumeration. A full Windows implementation walks `EnumProcessModules` plus
//! `GetModuleInformation`; that glue sits outside the core and is not implemented here.

use crate::error::{Error, Result};
use crate::module::ModuleDescriptor;

pub fn enumerate_modules() -> Result<Vec<ModuleDescriptor>> {
    Err(Error::NotImplemented(
        "module enumeration is only implemented for Linux",
    ))
}

pub fn main_module() -> Result<ModuleDescriptor> {
    Err(Error::NotImplemented(
        "module enumeration is only implemented for Linux",
    ))
}
