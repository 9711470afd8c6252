// src/link/lock.rs

//! Prefix-wide mutual exclusion
//!
//! Link and unlink are the only mutators of the shared prefix. Every
//! operation that reaches them runs while holding a [`PrefixLock`], an
//! advisory exclusive lock on a file scoped to the prefix, so two
//! processes never interleave their link-phase file operations.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct PrefixLock {
    file: File,
    path: PathBuf,
}

impl PrefixLock {
    /// Acquire the lock at `path`, waiting for any other holder to finish
    pub fn acquire(path: &Path, holder: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            let holder_info = fs::read_to_string(path).unwrap_or_default();
            info!(
                "Waiting for prefix lock {} (held by {})",
                path.display(),
                holder_info.trim()
            );
            file.lock_exclusive()?;
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "pid {} {}", std::process::id(), holder)?;
        file.flush()?;

        debug!("Acquired prefix lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PrefixLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release prefix lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released prefix lock {}", self.path.display());
        }
    }
}
