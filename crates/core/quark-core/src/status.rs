//! The kernel status set.
//!
//! Errors are values of a single closed enum shared across all kernel
//! components and the service RPC boundary. Success is expressed through
//! `Ok(..)` of [`OsResult`], never as an enum member.

use core::fmt;

/// Kernel-wide error codes.
///
/// The set is closed: no component defines its own error type, and
/// nothing propagates out-of-band. Codes cross the RPC boundary via
/// [`OsError::code`] / [`OsError::from_code`], where `0` is reserved
/// for success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OsError {
    /// One or more parameters were invalid.
    InvalidParameters = 1,
    /// The referenced object does not exist.
    DoesNotExist,
    /// The object already exists.
    Exists,
    /// The resource is busy.
    Busy,
    /// Out of physical or virtual memory.
    OutOfMemory,
    /// A mass operation was only partially completed.
    Incomplete,
    /// The caller lacks the required access.
    AccessDenied,
    /// The operation was interrupted before completion.
    Interrupted,
    /// The operation timed out.
    Timeout,
    /// The operation is not supported.
    NotSupported,
    /// A storage device reported an error.
    DiskError,
    /// The path could not be resolved.
    PathNotFound,
    /// A path component was not a directory.
    PathIsNotDirectory,
    /// The remote peer violated the protocol.
    Protocol,
}

/// Result alias used by every fallible kernel operation.
pub type OsResult<T = ()> = Result<T, OsError>;

impl OsError {
    /// Returns the wire code for this error (`>= 1`; `0` means success).
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Decodes a wire code. `0` (success) and unknown codes yield `None`.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::InvalidParameters,
            2 => Self::DoesNotExist,
            3 => Self::Exists,
            4 => Self::Busy,
            5 => Self::OutOfMemory,
            6 => Self::Incomplete,
            7 => Self::AccessDenied,
            8 => Self::Interrupted,
            9 => Self::Timeout,
            10 => Self::NotSupported,
            11 => Self::DiskError,
            12 => Self::PathNotFound,
            13 => Self::PathIsNotDirectory,
            14 => Self::Protocol,
            _ => return None,
        })
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InvalidParameters => "invalid parameters",
            Self::DoesNotExist => "does not exist",
            Self::Exists => "already exists",
            Self::Busy => "busy",
            Self::OutOfMemory => "out of memory",
            Self::Incomplete => "operation incomplete",
            Self::AccessDenied => "access denied",
            Self::Interrupted => "interrupted",
            Self::Timeout => "timed out",
            Self::NotSupported => "not supported",
            Self::DiskError => "disk error",
            Self::PathNotFound => "path not found",
            Self::PathIsNotDirectory => "path is not a directory",
            Self::Protocol => "protocol violation",
        };
        f.write_str(text)
    }
}
