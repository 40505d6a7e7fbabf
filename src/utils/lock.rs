// Host-wide advisory run lock
use fs4::fs_std::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, Result};

/// Exclusive lock held for the whole destructive part of a backup or restore.
///
/// The lock is an `flock` on a file under the data root, so the kernel drops
/// it when the process dies, however it dies.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Takes the lock or fails immediately with `LockHeld`; never waits.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(true) => {}
            Ok(false) => return Err(AppError::LockHeld(path.to_path_buf())),
            Err(e) => return Err(e.into()),
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!("Acquired run lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release run lock {}: {}", self.path.display(), e);
        } else {
            tracing::debug!("Released run lock {}", self.path.display());
        }
    }
}
