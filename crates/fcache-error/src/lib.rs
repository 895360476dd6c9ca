#![forbid(unsafe_code)]
//! Error types for fcache.
//!
//! Defines `FcError` and a `Result<T>` alias used throughout the workspace.
//! Precondition violations surface as error values; engine invariant
//! violations and eviction starvation are fatal and panic instead.

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum FcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot open {0}")]
    CantOpen(String),

    #[error("file {0} is already open")]
    AlreadyInUse(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("end of file reached")]
    Eof,

    #[error("read failed: {0}")]
    CantRead(String),

    #[error("write failed: {0}")]
    CantWrite(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("no such handle: {0:#x}")]
    NoSuchHandle(u32),
}

/// Result alias using `FcError`.
pub type Result<T> = std::result::Result<T, FcError>;
