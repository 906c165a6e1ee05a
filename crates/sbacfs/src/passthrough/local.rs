//! Passthrough to a directory on the host.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DirEntry, Filesystem, FsError, FsResult, Metadata, StatFs};
use crate::engine::PermissionOracle;
use crate::request::{AccessClass, FMODE_EXEC};

/// [`Filesystem`] that maps mount-relative paths onto `root` and performs
/// every operation there.
#[derive(Debug)]
pub struct PassthroughFs {
    root: PathBuf,
    handles: Mutex<HashMap<u64, File>>,
    next_handle: AtomicU64,
}

impl PassthroughFs {
    /// Serve the directory `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handles: Mutex::default(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// The host directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Translate a mount-relative path onto the root.
    ///
    /// `..` components are rejected rather than resolved.
    pub fn real_path(&self, path: &str) -> FsResult<PathBuf> {
        let mut real = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => real.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(FsError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(real)
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, File>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, file: File) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(fh, file);
        fh
    }

    /// A second descriptor for an open handle, so I/O runs without the
    /// table lock.
    fn handle(&self, path: &str, fh: u64) -> FsResult<File> {
        let handles = self.handles();
        let file = handles
            .get(&fh)
            .ok_or_else(|| FsError::Io(std::io::Error::from_raw_os_error(libc::EBADF)))?;
        file.try_clone().map_err(|e| FsError::from_io(path, e))
    }
}

fn c_path(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::InvalidPath(path.display().to_string()))
}

impl Filesystem for PassthroughFs {
    fn getattr(&self, path: &str) -> FsResult<Metadata> {
        let real = self.real_path(path)?;
        let meta = fs::symlink_metadata(&real).map_err(|e| FsError::from_io(path, e))?;
        Ok(Metadata::from(&meta))
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        let real = self.real_path(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&real).map_err(|e| FsError::from_io(path, e))? {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn open(&self, path: &str, flags: i32) -> FsResult<u64> {
        let real = self.real_path(path)?;
        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .custom_flags(flags & !(libc::O_ACCMODE | FMODE_EXEC))
            .open(&real)
            .map_err(|e| FsError::from_io(path, e))?;
        let fh = self.register(file);
        tracing::trace!(path, fh, flags, "opened file");
        Ok(fh)
    }

    fn read(&self, path: &str, fh: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let file = self.handle(path, fh)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| FsError::from_io(path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, path: &str, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let file = self.handle(path, fh)?;
        file.write_all_at(data, offset)
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(data.len())
    }

    fn create(&self, path: &str, mode: u32) -> FsResult<u64> {
        let real = self.real_path(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&real)
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(self.register(file))
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        let real = self.real_path(path)?;
        fs::remove_file(real).map_err(|e| FsError::from_io(path, e))
    }

    fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let real = self.real_path(path)?;
        fs::DirBuilder::new()
            .mode(mode)
            .create(real)
            .map_err(|e| FsError::from_io(path, e))
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        let real = self.real_path(path)?;
        fs::remove_dir(real).map_err(|e| FsError::from_io(path, e))
    }

    fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let real_from = self.real_path(from)?;
        let real_to = self.real_path(to)?;
        fs::rename(real_from, real_to).map_err(|e| FsError::from_io(from, e))
    }

    fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        let real = self.real_path(link)?;
        std::os::unix::fs::symlink(target, real).map_err(|e| FsError::from_io(link, e))
    }

    fn readlink(&self, path: &str) -> FsResult<String> {
        let real = self.real_path(path)?;
        let target = fs::read_link(real).map_err(|e| FsError::from_io(path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn truncate(&self, path: &str, length: u64, fh: Option<u64>) -> FsResult<()> {
        let file = match fh {
            Some(fh) => self.handle(path, fh)?,
            None => OpenOptions::new()
                .write(true)
                .open(self.real_path(path)?)
                .map_err(|e| FsError::from_io(path, e))?,
        };
        file.set_len(length).map_err(|e| FsError::from_io(path, e))
    }

    fn access(&self, path: &str, mask: i32) -> FsResult<()> {
        let real = c_path(&self.real_path(path)?)?;
        // SAFETY: `real` is a valid NUL-terminated string that outlives the call.
        let rc = unsafe { libc::access(real.as_ptr(), mask) };
        if rc == 0 {
            Ok(())
        } else {
            Err(FsError::from_io(path, std::io::Error::last_os_error()))
        }
    }

    fn statfs(&self, path: &str) -> FsResult<StatFs> {
        let real = c_path(&self.real_path(path)?)?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        // SAFETY: `real` is NUL-terminated and `stat` points to writable
        // memory large enough for a statvfs.
        let rc = unsafe { libc::statvfs(real.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(FsError::from_io(path, std::io::Error::last_os_error()));
        }
        // SAFETY: statvfs returned 0, so it filled the struct.
        let stat = unsafe { stat.assume_init() };
        #[allow(clippy::unnecessary_cast)]
        let stat = StatFs {
            block_size: stat.f_frsize as u64,
            blocks: stat.f_blocks as u64,
            blocks_free: stat.f_bfree as u64,
            blocks_available: stat.f_bavail as u64,
            files: stat.f_files as u64,
            files_free: stat.f_ffree as u64,
            name_max: stat.f_namemax as u64,
        };
        Ok(stat)
    }

    fn flush(&self, path: &str, fh: u64) -> FsResult<()> {
        // Writes go straight to the descriptor; only check the handle exists.
        self.handle(path, fh).map(drop)
    }

    fn release(&self, path: &str, fh: u64) -> FsResult<()> {
        match self.handles().remove(&fh) {
            Some(_) => {
                tracing::trace!(path, fh, "released file");
                Ok(())
            }
            None => Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EBADF))),
        }
    }

    fn fsync(&self, path: &str, fh: u64, datasync: bool) -> FsResult<()> {
        let file = self.handle(path, fh)?;
        let synced = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        synced.map_err(|e| FsError::from_io(path, e))
    }
}

impl PermissionOracle for PassthroughFs {
    fn os_permits(&self, path: &str, class: AccessClass) -> bool {
        self.access(path, class.access_mask()).is_ok()
    }
}
