//! Single source of truth for the file service contract.
//!
//! The file service runs in user space; drivers and applications reach
//! it through handle-based RPC. This crate pins down the operation set,
//! the flag words and the record types both sides share — bulk data
//! never travels inline, it moves through memory regions named by
//! handle, so a read or write request carries a region handle plus an
//! offset and length into it.
//!
//! Error codes on the wire are the kernel status set
//! ([`OsError::code`]), with `0` reserved for success.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod dispatch;

use alloc::string::String;
use alloc::vec::Vec;

use quark_core::id::Handle;
use quark_core::status::{OsError, OsResult};

bitflags::bitflags! {
    /// How an opened file may be used, and what concurrent openers may
    /// do with it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAccess: u32 {
        /// Reads allowed.
        const READ = 1 << 0;
        /// Writes allowed.
        const WRITE = 1 << 1;
        /// Other openers may read while this handle is open.
        const SHARE_READ = 1 << 8;
        /// Other openers may write while this handle is open.
        const SHARE_WRITE = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Open-time behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileOptions: u32 {
        /// Create the file if it does not exist.
        const CREATE = 1 << 0;
        /// Truncate existing contents.
        const TRUNCATE = 1 << 1;
        /// Fail if the file does not exist.
        const MUST_EXIST = 1 << 2;
        /// Fail if the file already exists.
        const FAIL_ON_EXIST = 1 << 3;
        /// Writes always append.
        const APPEND = 1 << 8;
        /// Delete when the last handle closes.
        const TEMPORARY = 1 << 11;
    }
}

bitflags::bitflags! {
    /// What a directory entry is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttrs: u32 {
        /// A directory.
        const DIRECTORY = 1 << 0;
        /// A symbolic link.
        const LINK = 1 << 1;
        /// Not writable through any handle.
        const READONLY = 1 << 2;
        /// Excluded from ordinary listings.
        const HIDDEN = 1 << 3;
    }
}

/// The stat record for a file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Entry name (no path components).
    pub name: String,
    /// Entry kind and properties.
    pub attributes: FileAttrs,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Number of hard links.
    pub links: u32,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// The entry's record.
    pub record: FileRecord,
    /// Position of the entry within the directory stream.
    pub index: u64,
}

/// The subject of a `stat` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatTarget {
    /// An open file handle.
    Handle(Handle),
    /// A path, resolved without opening.
    Path(String),
}

/// Every operation the file service accepts.
///
/// This enum is the protocol: adding an operation means touching this
/// crate, and both sides compile against the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequest {
    /// Opens `path`, yielding a file handle.
    Open {
        /// Absolute path.
        path: String,
        /// Open-time behavior.
        options: FileOptions,
        /// Requested access and sharing.
        access: FileAccess,
    },
    /// Closes an open handle.
    Close {
        /// The handle to close.
        handle: Handle,
    },
    /// Reads into the memory region `buffer` at `buffer_offset`.
    Read {
        /// Source file.
        handle: Handle,
        /// Destination region.
        buffer: Handle,
        /// Offset within the region.
        buffer_offset: u64,
        /// Bytes to transfer.
        length: u64,
    },
    /// Writes from the memory region `buffer` at `buffer_offset`.
    Write {
        /// Destination file.
        handle: Handle,
        /// Source region.
        buffer: Handle,
        /// Offset within the region.
        buffer_offset: u64,
        /// Bytes to transfer.
        length: u64,
    },
    /// Moves the file position.
    Seek {
        /// The file whose position moves.
        handle: Handle,
        /// Absolute position in bytes.
        position: u64,
    },
    /// Retrieves the record of a handle or path.
    Stat(StatTarget),
    /// Creates a directory.
    MakeDir {
        /// Absolute path of the new directory.
        path: String,
    },
    /// Removes a file or empty directory.
    Unlink {
        /// Absolute path to remove.
        path: String,
    },
    /// Renames or moves, optionally copying instead.
    Move {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
        /// Copy instead of moving.
        copy: bool,
    },
    /// Creates a link.
    Link {
        /// Link target.
        from: String,
        /// Path of the new link.
        to: String,
        /// Symbolic instead of hard.
        symbolic: bool,
    },
    /// Reads the next directory entry.
    ReadDir {
        /// An open directory handle.
        handle: Handle,
    },
    /// Flushes buffered state of a handle.
    Flush {
        /// The handle to flush.
        handle: Handle,
    },
    /// Mounts a filesystem.
    Mount {
        /// Backing path (device or image).
        path: String,
        /// Mount point.
        at: String,
        /// Filesystem type name, or empty for detection.
        fs_type: String,
        /// Mount flags (filesystem-specific).
        flags: u32,
    },
    /// Unmounts the filesystem at `path`.
    Unmount {
        /// Mount point.
        path: String,
    },
}

/// Responses, paired with [`FileRequest`] by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileResponse {
    /// Operation completed with no payload.
    Done,
    /// `Open` succeeded.
    Opened {
        /// The new file handle.
        handle: Handle,
    },
    /// `Read`/`Write` transferred this many bytes.
    Transferred {
        /// Bytes actually moved.
        bytes: u64,
    },
    /// `Stat` result.
    Record(FileRecord),
    /// `ReadDir` result; `None` at end of directory.
    Entry(Option<DirectoryEntry>),
    /// The operation failed; the payload is [`OsError::code`].
    Failed {
        /// Wire code of the error (`>= 1`).
        code: u32,
    },
}

impl FileResponse {
    /// Wraps a result, mapping errors to their wire code.
    pub fn from_result(result: OsResult<FileResponse>) -> Self {
        match result {
            Ok(response) => response,
            Err(err) => Self::Failed { code: err.code() },
        }
    }

    /// The error carried by a `Failed` response, if any.
    #[must_use]
    pub fn error(&self) -> Option<OsError> {
        match self {
            Self::Failed { code } => OsError::from_code(*code),
            _ => None,
        }
    }
}

/// The operations a file service implementation provides. The
/// [`dispatch`](dispatch::dispatch) glue maps [`FileRequest`]s onto
/// these methods, so an implementation cannot drift from the protocol.
pub trait FileService {
    /// Opens a file. See [`FileRequest::Open`].
    fn open(&self, path: &str, options: FileOptions, access: FileAccess) -> OsResult<Handle>;
    /// Closes a handle.
    fn close(&self, handle: Handle) -> OsResult;
    /// Reads into a region; returns bytes transferred.
    fn read(&self, handle: Handle, buffer: Handle, buffer_offset: u64, length: u64)
    -> OsResult<u64>;
    /// Writes from a region; returns bytes transferred.
    fn write(
        &self,
        handle: Handle,
        buffer: Handle,
        buffer_offset: u64,
        length: u64,
    ) -> OsResult<u64>;
    /// Moves the position of `handle`.
    fn seek(&self, handle: Handle, position: u64) -> OsResult;
    /// Stats a handle or path.
    fn stat(&self, target: &StatTarget) -> OsResult<FileRecord>;
    /// Creates a directory.
    fn make_dir(&self, path: &str) -> OsResult;
    /// Removes a file or empty directory.
    fn unlink(&self, path: &str) -> OsResult;
    /// Renames, moves or copies.
    fn rename(&self, from: &str, to: &str, copy: bool) -> OsResult;
    /// Creates a hard or symbolic link.
    fn link(&self, from: &str, to: &str, symbolic: bool) -> OsResult;
    /// Reads the next entry of an open directory.
    fn read_dir(&self, handle: Handle) -> OsResult<Option<DirectoryEntry>>;
    /// Flushes buffered state.
    fn flush(&self, handle: Handle) -> OsResult;
    /// Mounts a filesystem.
    fn mount(&self, path: &str, at: &str, fs_type: &str, flags: u32) -> OsResult;
    /// Unmounts the filesystem at `path`.
    fn unmount(&self, path: &str) -> OsResult;
}

/// Convenience alias for a boxed directory stream, used by service
/// implementations that buffer listings.
pub type DirectoryStream = Vec<DirectoryEntry>;
