//! The filesystem surface the access engine sits in front of.
//!
//! This module provides:
//! - [`Filesystem`] - the operations a FUSE dispatcher forwards, on
//!   mount-relative paths (`/dir/file`)
//! - [`PassthroughFs`] - forwards every operation to a directory on the host
//! - [`GuardedFs`] - asks an [`AccessEngine`](crate::AccessEngine) before
//!   forwarding, and fails denied operations with `EPERM`

mod guarded;
mod local;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use guarded::GuardedFs;
pub use local::PassthroughFs;

/// Filesystem errors, each with an errno for the kernel.
#[derive(Debug, Error)]
pub enum FsError {
    /// File or directory not found
    #[error("file not found: {0}")]
    NotFound(String),
    /// The access engine refused the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Invalid path format
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// IO error from the backing filesystem
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno to hand back to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::PermissionDenied(_) => libc::EPERM,
            FsError::InvalidPath(_) => libc::EINVAL,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub(crate) fn from_io(path: &str, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            FsError::NotFound(path.to_string())
        } else {
            FsError::Io(error)
        }
    }
}

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Whether this entry is a directory
    pub is_dir: bool,
}

/// File/directory attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Whether this is a directory
    pub is_dir: bool,
    /// Whether this is a symbolic link
    pub is_symlink: bool,
    /// Size in bytes
    pub size: u64,
    /// Permission and type bits (`st_mode`)
    pub mode: u32,
    /// Number of hard links
    pub nlink: u64,
    /// Owner
    pub uid: u32,
    /// Group
    pub gid: u32,
    /// Last modification, seconds since the epoch
    pub mtime: i64,
}

impl From<&std::fs::Metadata> for Metadata {
    fn from(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
            size: meta.len(),
            mode: meta.mode(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: meta.mtime(),
        }
    }
}

/// Filesystem statistics (`statvfs`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    /// Fragment size
    pub block_size: u64,
    /// Total blocks
    pub blocks: u64,
    /// Free blocks
    pub blocks_free: u64,
    /// Blocks available to unprivileged users
    pub blocks_available: u64,
    /// Total inodes
    pub files: u64,
    /// Free inodes
    pub files_free: u64,
    /// Maximum file name length
    pub name_max: u64,
}

/// The operations a FUSE dispatcher forwards.
///
/// Paths are mount-relative and absolute (`/`, `/dir/file`). File handles
/// are opaque numbers returned by [`open`](Filesystem::open) and
/// [`create`](Filesystem::create). Implementations are called from many
/// dispatcher threads at once.
pub trait Filesystem: Send + Sync {
    /// Attributes of a path, without following a final symlink.
    fn getattr(&self, path: &str) -> FsResult<Metadata>;

    /// Entries of a directory, excluding `.` and `..`.
    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// Open an existing file with the given `open(2)` flags.
    fn open(&self, path: &str, flags: i32) -> FsResult<u64>;

    /// Read up to `size` bytes at `offset`.
    fn read(&self, path: &str, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write(&self, path: &str, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize>;

    /// Create and open a file with permission bits `mode`.
    fn create(&self, path: &str, mode: u32) -> FsResult<u64>;

    /// Remove a file.
    fn unlink(&self, path: &str) -> FsResult<()>;

    /// Create a directory with permission bits `mode`.
    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &str) -> FsResult<()>;

    /// Rename `from` to `to`.
    fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// Create a symbolic link at `link` pointing to `target`.
    ///
    /// `target` is stored verbatim and not translated.
    fn symlink(&self, target: &str, link: &str) -> FsResult<()>;

    /// Target of a symbolic link.
    fn readlink(&self, path: &str) -> FsResult<String>;

    /// Set the length of a file, through `fh` when one is open.
    fn truncate(&self, path: &str, length: u64, fh: Option<u64>) -> FsResult<()>;

    /// Check `access(2)` permission bits (`R_OK`, `W_OK`, `X_OK`, `F_OK`).
    fn access(&self, path: &str, mask: i32) -> FsResult<()>;

    /// Statistics of the filesystem holding `path`.
    fn statfs(&self, path: &str) -> FsResult<StatFs>;

    /// Flush buffered data of an open file.
    fn flush(&self, path: &str, fh: u64) -> FsResult<()>;

    /// Close a file handle.
    fn release(&self, path: &str, fh: u64) -> FsResult<()>;

    /// Synchronise an open file to storage; only data when `datasync`.
    fn fsync(&self, path: &str, fh: u64, datasync: bool) -> FsResult<()>;
}
