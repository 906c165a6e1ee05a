//! Access-checking filesystem wrapper.

use std::sync::Arc;

use super::{DirEntry, Filesystem, FsError, FsResult, Metadata, StatFs};
use crate::engine::{AccessDecision, AccessEngine, PermissionOracle};
use crate::request::{AccessRequest, Mode};

/// A filesystem wrapper that asks an [`AccessEngine`] before forwarding.
///
/// Operations that read or change file contents or the namespace are
/// checked; attribute lookups, `readlink`, `access`, `statfs` and the
/// handle bookkeeping calls (`flush`, `release`, `fsync`) pass straight
/// through. A denied operation fails with [`FsError::PermissionDenied`]
/// (`EPERM`) and the inner filesystem is never called.
///
/// ## Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use sbacfs::{AccessEngine, GuardedFs, PassthroughFs};
///
/// let engine = Arc::new(AccessEngine::builder().build());
/// let fs = GuardedFs::new(Arc::new(PassthroughFs::new("/srv/data")), engine);
///
/// let fh = fs.open("/notes.txt", libc::O_RDONLY)?;
/// ```
pub struct GuardedFs<F: Filesystem + PermissionOracle> {
    inner: Arc<F>,
    engine: Arc<AccessEngine>,
}

impl<F: Filesystem + PermissionOracle> GuardedFs<F> {
    /// Wrap `inner`, deciding every checked operation with `engine`.
    pub fn new(inner: Arc<F>, engine: Arc<AccessEngine>) -> Self {
        Self { inner, engine }
    }

    /// The wrapped filesystem.
    pub fn inner(&self) -> &Arc<F> {
        &self.inner
    }

    /// The engine deciding requests.
    pub fn engine(&self) -> &Arc<AccessEngine> {
        &self.engine
    }

    fn check(&self, request: AccessRequest) -> FsResult<()> {
        match self.engine.decide(&request, self.inner.as_ref()) {
            AccessDecision::Granted(_) => Ok(()),
            AccessDecision::Denied(denial) => {
                tracing::debug!(
                    path = %request.path,
                    mode = %request.mode,
                    reason = %denial,
                    "access engine denied operation"
                );
                Err(FsError::PermissionDenied(format!("{}: {denial}", request.path)))
            }
        }
    }
}

impl<F: Filesystem + PermissionOracle> Clone for GuardedFs<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<F: Filesystem + PermissionOracle> std::fmt::Debug for GuardedFs<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedFs")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl<F: Filesystem + PermissionOracle> Filesystem for GuardedFs<F> {
    fn getattr(&self, path: &str) -> FsResult<Metadata> {
        self.inner.getattr(path)
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        self.check(AccessRequest::new(path, Mode::Readdir))?;
        self.inner.readdir(path)
    }

    fn open(&self, path: &str, flags: i32) -> FsResult<u64> {
        self.check(AccessRequest::open(path, flags))?;
        self.inner.open(path, flags)
    }

    fn read(&self, path: &str, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        self.check(AccessRequest::new(path, Mode::Read))?;
        self.inner.read(path, fh, offset, size)
    }

    fn write(&self, path: &str, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.check(AccessRequest::new(path, Mode::Write))?;
        self.inner.write(path, fh, offset, data)
    }

    fn create(&self, path: &str, mode: u32) -> FsResult<u64> {
        self.check(AccessRequest::new(path, Mode::Create))?;
        self.inner.create(path, mode)
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        self.check(AccessRequest::new(path, Mode::Unlink))?;
        self.inner.unlink(path)
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.check(AccessRequest::new(path, Mode::Mkdir))?;
        self.inner.mkdir(path, mode)
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        self.check(AccessRequest::new(path, Mode::Rmdir))?;
        self.inner.rmdir(path)
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.check(AccessRequest::new(to, Mode::Rename))?;
        self.check(AccessRequest::new(from, Mode::Rename))?;
        self.inner.rename(from, to)
    }

    fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        self.check(AccessRequest::new(link, Mode::Symlink))?;
        self.inner.symlink(target, link)
    }

    fn readlink(&self, path: &str) -> FsResult<String> {
        self.inner.readlink(path)
    }

    fn truncate(&self, path: &str, length: u64, fh: Option<u64>) -> FsResult<()> {
        self.check(AccessRequest::new(path, Mode::Truncate))?;
        self.inner.truncate(path, length, fh)
    }

    fn access(&self, path: &str, mask: i32) -> FsResult<()> {
        self.inner.access(path, mask)
    }

    fn statfs(&self, path: &str) -> FsResult<StatFs> {
        self.inner.statfs(path)
    }

    fn flush(&self, path: &str, fh: u64) -> FsResult<()> {
        self.inner.flush(path, fh)
    }

    fn release(&self, path: &str, fh: u64) -> FsResult<()> {
        self.inner.release(path, fh)
    }

    fn fsync(&self, path: &str, fh: u64, datasync: bool) -> FsResult<()> {
        self.inner.fsync(path, fh, datasync)
    }
}
