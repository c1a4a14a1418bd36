//! The library's stable error taxonomy.
//!
//! Every fallible operation in `dbgutil` returns one of these variants. Parsers return
//! [`Error::DataCorrupt`] on structural violations and [`Error::NotImplemented`] on
//! unsupported-but-valid input; lookup routines return [`Error::NotFound`] as an ordinary,
//! non-fatal outcome.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    NoMem,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(&'static str),
    #[error("system call failed: {0}")]
    SystemFailure(#[from] std::io::Error),
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("end of file")]
    Eof,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("end of stream")]
    EndOfStream,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("data corrupt: {0}")]
    DataCorrupt(String),
    #[error("resource busy")]
    ResourceBusy,

    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("posix syscall error: {0}")]
    Errno(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
