//! Exclusive reorder lock on a store directory

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock file name inside a store directory
pub const LOCK_FILE: &str = ".reorder.lock";

/// Ownership token of the single mutator of a store.
///
/// Holds an OS advisory lock on the lock file. A second reorder fails
/// instead of waiting; the lock goes away with the process, so a file left
/// behind by a crash does not block the resume.
#[derive(Debug)]
pub struct ReorderLock {
    file: File,
    path: PathBuf,
    token: Uuid,
}

impl ReorderLock {
    /// Take the lock or fail with `ConcurrentReorder`
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(Error::ConcurrentReorder { holder });
            }
            return Err(Error::Io(e));
        }

        // Contents only describe the holder; the OS lock is what counts
        let token = Uuid::new_v4();
        file.set_len(0)?;
        writeln!(file, "{} pid={}", token, std::process::id())?;
        file.sync_all()?;
        debug!(path = %path.display(), %token, "reorder lock acquired");
        Ok(Self { file, path, token })
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

impl Drop for ReorderLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release reorder lock");
        }
    }
}
