//! Single-instance lock.
//!
//! Two clients would fight over the split default route and the relay host
//! route, so only one may run at a time.

use crate::error::{SetupError, SetupResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = "wstun.lock";

/// Held for the lifetime of the process; released when dropped.
pub struct TunnelLock {
    path: PathBuf,
    // Kept open to hold the advisory lock.
    _file: File,
}

impl TunnelLock {
    /// Acquire the lock at the default runtime location.
    pub fn acquire() -> SetupResult<Self> {
        Self::acquire_at(&default_lock_path())
    }

    /// Acquire the lock at `path`, writing our PID into it.
    pub fn acquire_at(path: &Path) -> SetupResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SetupError::lock_with_source("Failed to create lock directory", e))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| SetupError::lock_with_source("Failed to open lock file", e))?;

        file.try_lock_exclusive().map_err(|_| {
            SetupError::lock(format!(
                "Another wstun client is already running (lock held on {})",
                path.display()
            ))
        })?;

        // Truncate only once the lock is ours.
        file.set_len(0)
            .map_err(|e| SetupError::lock_with_source("Failed to truncate lock file", e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| SetupError::lock_with_source("Failed to seek lock file", e))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| SetupError::lock_with_source("Failed to write PID to lock file", e))?;

        log::debug!("Acquired lock: {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TunnelLock {
    fn drop(&mut self) {
        // The file is left in place; unlinking it would let two processes
        // lock different inodes under the same name.
        log::debug!("Released lock: {}", self.path.display());
    }
}

/// `$XDG_RUNTIME_DIR`, then `$TMPDIR`, then `/tmp`.
fn default_lock_path() -> PathBuf {
    ["XDG_RUNTIME_DIR", "TMPDIR"]
        .iter()
        .find_map(|var| std::env::var_os(var))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(LOCK_FILE_NAME)
}
