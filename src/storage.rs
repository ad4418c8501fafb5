use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Scoped filesystem gateway. Every operand is checked to stay under the
/// configured base; nothing here ever touches a path outside it.
#[derive(Debug, Clone)]
pub struct StorageRoot {
    base: PathBuf,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("path escapes the storage root: {path}")]
    OutOfRoot { path: String },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("permission denied: {path}")]
    Permission { path: String },
    #[error("already exists: {path}")]
    Exists { path: String },
    #[error("cross-device operation on {path}: {source}")]
    CrossDevice {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        let path = path.display().to_string();
        match source.kind() {
            io::ErrorKind::NotFound => FsError::NotFound { path },
            io::ErrorKind::PermissionDenied => FsError::Permission { path },
            io::ErrorKind::AlreadyExists => FsError::Exists { path },
            _ => FsError::Io { path, source },
        }
    }
}

// EXDEV is not a stable io::ErrorKind; match the raw errno so the rename
// fallback only triggers for genuine cross-device moves.
#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(18) // EXDEV
}

#[cfg(not(unix))]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(17) // ERROR_NOT_SAME_DEVICE
}

impl StorageRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Refuse any path that does not sit under the base once lexically
    /// normalized. `..` and relative inputs are rejected outright.
    pub fn check_scoped(&self, path: &Path) -> Result<(), FsError> {
        use std::path::Component;
        if !path.is_absolute() {
            return Err(FsError::OutOfRoot {
                path: path.display().to_string(),
            });
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(FsError::OutOfRoot {
                path: path.display().to_string(),
            });
        }
        if !path.starts_with(&self.base) {
            return Err(FsError::OutOfRoot {
                path: path.display().to_string(),
            });
        }
        Ok(())
    }

    pub fn exists(&self, path: &Path) -> Result<bool, FsError> {
        self.check_scoped(path)?;
        Ok(path.exists())
    }

    pub fn file_size(&self, path: &Path) -> Result<u64, FsError> {
        self.check_scoped(path)?;
        let meta = fs::metadata(path).map_err(|e| FsError::from_io(path, e))?;
        Ok(meta.len())
    }

    /// `mkdir -p` under the root.
    pub fn ensure_dir(&self, path: &Path) -> Result<(), FsError> {
        self.check_scoped(path)?;
        fs::create_dir_all(path).map_err(|e| FsError::from_io(path, e))
    }

    /// Immediate child directories of `path`.
    pub fn list_dirs(&self, path: &Path) -> Result<Vec<PathBuf>, FsError> {
        self.check_scoped(path)?;
        let mut dirs = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| FsError::from_io(path, e))? {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            let candidate = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => dirs.push(candidate),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "sentinelle",
                        event = "storage_list_entry_error",
                        path = %candidate.display(),
                        error = %e,
                    );
                }
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Immediate plain files of `path`. A missing directory yields an empty
    /// listing; agents create `log/` lazily.
    pub fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>, FsError> {
        self.check_scoped(path)?;
        let read = match fs::read_dir(path) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::from_io(path, e)),
        };
        let mut files = Vec::new();
        for entry in read {
            let entry = entry.map_err(|e| FsError::from_io(path, e))?;
            let candidate = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_file() => files.push(candidate),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "sentinelle",
                        event = "storage_list_entry_error",
                        path = %candidate.display(),
                        error = %e,
                    );
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Atomic rename when source and destination share a volume; falls back
    /// to copy+unlink across devices. The destination parent is created.
    pub fn move_file(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        self.check_scoped(src)?;
        self.check_scoped(dst)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::from_io(parent, e))?;
        }
        match fs::rename(src, dst) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                tracing::warn!(
                    target: "sentinelle",
                    event = "storage_move_cross_device",
                    src = %src.display(),
                    dst = %dst.display(),
                );
                copy_with_mtime(src, dst).map_err(|err| match err {
                    FsError::Io { path, source } => FsError::CrossDevice { path, source },
                    other => other,
                })?;
                fs::remove_file(src).map_err(|e| FsError::from_io(src, e))
            }
            Err(e) => Err(FsError::from_io(src, e)),
        }
    }

    /// Overwriting copy that preserves the source mtime. The destination
    /// parent is created.
    pub fn copy_file(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        self.check_scoped(src)?;
        self.check_scoped(dst)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::from_io(parent, e))?;
        }
        copy_with_mtime(src, dst)
    }

    /// Overwriting copy whose source lives outside this root (the caller
    /// vouches for it, typically via another `StorageRoot`). Only the
    /// destination is scope-checked.
    pub fn copy_in(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        self.check_scoped(dst)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::from_io(parent, e))?;
        }
        copy_with_mtime(src, dst)
    }

    /// Deleting a file that is already gone is not an error.
    pub fn delete_file(&self, path: &Path) -> Result<(), FsError> {
        self.check_scoped(path)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::from_io(path, e)),
        }
    }
}

fn copy_with_mtime(src: &Path, dst: &Path) -> Result<(), FsError> {
    fs::copy(src, dst).map_err(|e| FsError::from_io(src, e))?;
    let meta = fs::metadata(src).map_err(|e| FsError::from_io(src, e))?;
    if let Ok(mtime) = meta.modified() {
        let dst_file = fs::OpenOptions::new()
            .write(true)
            .open(dst)
            .map_err(|e| FsError::from_io(dst, e))?;
        let times = fs::FileTimes::new().set_modified(mtime);
        if let Err(e) = dst_file.set_times(times) {
            tracing::warn!(
                target: "sentinelle",
                event = "storage_copy_mtime_failed",
                dst = %dst.display(),
                error = %e,
            );
        }
    }
    Ok(())
}
