#![forbid(unsafe_code)]
//! Error types for SiltFS.
//!
//! Defines `FsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the mount-bridge response codes.
//!
//! Errors fall into three kinds: user errors (bad path, permission,
//! name too long), capacity errors (`NoSpace`), and invariant violations
//! (`Corrupted`, `Invariant`, `OutOfRange`) which the core treats as fatal
//! and never retries.

use thiserror::Error;

/// Unified error type for all SiltFS operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index {index} out of range (limit {limit})")]
    OutOfRange { index: u64, limit: u64 },

    #[error("corrupted volume: {0}")]
    Corrupted(String),

    #[error("no space left on volume")]
    NoSpace,

    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl FsError {
    /// Convert this error into a POSIX errno suitable for bridge replies.
    ///
    /// Capacity exhaustion surfaces as `EDQUOT`, the code the bridge
    /// reports for "out of space"; invariant violations surface as
    /// `EFAULT`.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupted(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::EDQUOT,
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::OutOfRange { .. } | Self::Invariant(_) => libc::EFAULT,
        }
    }
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;
