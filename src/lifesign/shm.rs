//! Shared-memory segment lifecycle: create (writer) and open-for-inspection (reader), Linux's
//! disk-backed `shm_open` path. `dbgutil.life-sign.<process_basename>.<timestamp>.<pid>.shm` is
//! the name under `/dev/shm`; because that's tmpfs-backed, the object survives the creator's
//! death and a reader can fall back to opening the same path as a plain file if `shm_open` can't
//! find it (e.g. permissions changed, or the reader runs as a different effective user).

use crate::error::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;

pub const SHM_DIRECTORY: &str = "/dev/shm";

pub fn segment_name(process_basename: &str, timestamp: &str, pid: u32) -> String {
    format!("dbgutil.life-sign.{process_basename}.{timestamp}.{pid}.shm")
}

fn shm_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIRECTORY).join(name)
}

/// Creates a new segment of `size` bytes, owned by this process. `name` must already be in the
/// `dbgutil.life-sign.*.shm` form `shm::segment_name` produces.
pub fn create(name: &str, size: usize) -> Result<MmapMut> {
    let cname = CString::new(format!("/{name}")).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        )
    };
    if fd < 0 {
        return Err(Error::SystemFailure(std::io::Error::last_os_error()));
    }
    let file = unsafe { File::from_raw_fd(fd as RawFd) };
    file.set_len(size as u64).map_err(Error::SystemFailure)?;
    let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(Error::SystemFailure)?;
    // `file` intentionally dropped here: POSIX shm objects are reference-counted by the kernel
    // through the mapping plus the `/dev/shm` directory entry, not by this `File` handle.
    Ok(mmap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOrigin {
    SharedMemory,
    BackingFile,
}

/// Maps an existing segment read-only for inspection, or read-write when `writable` is set (the
/// guardian flow that stamps `last_seen`/`last_sync`). Falls back to opening the `/dev/shm` path
/// directly as a regular file if the named `shm_open` object is gone.
pub fn open_for_inspection(name: &str, writable: bool) -> Result<(memmap2::Mmap, MappingOrigin)> {
    let cname = CString::new(format!("/{name}")).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    let mode = if writable { libc::O_RDWR } else { libc::O_RDONLY };
    let fd = unsafe { libc::shm_open(cname.as_ptr(), mode, 0) };

    let (file, origin) = if fd >= 0 {
        (unsafe { File::from_raw_fd(fd as RawFd) }, MappingOrigin::SharedMemory)
    } else {
        let file = File::open(shm_path(name)).map_err(Error::SystemFailure)?;
        (file, MappingOrigin::BackingFile)
    };

    let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(Error::SystemFailure)?;
    Ok((mmap, origin))
}

pub fn unlink(name: &str) -> Result<()> {
    let cname = CString::new(format!("/{name}")).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
        return Err(Error::SystemFailure(std::io::Error::last_os_error()));
    }
    Ok(())
}
