//! Process Lock File Module
//!
//! Prevents multiple engine instances from opening the same data directory,
//! which would cause database lock conflicts with sled and break the
//! single-writer guarantee.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Process lock file manager
///
/// Creates a lock file with the current process ID so a second instance
/// fails fast instead of corrupting the event log.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    owned: bool,
}

impl ProcessLock {
    /// Lock file name
    const LOCK_FILE_NAME: &'static str = ".eldcore.lock";

    /// Acquire a process lock for the given data directory
    ///
    /// Returns an error if another instance is already running. A lock file
    /// left by a dead process is removed and re-acquired.
    pub fn acquire<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let lock_path = data_dir.join(Self::LOCK_FILE_NAME);

        if lock_path.exists() {
            match Self::holder_pid(&lock_path) {
                Ok(Some(pid)) => {
                    bail!(
                        "Another eldcore instance is already running (PID: {}). \
                         Stop it, or remove a stale lock at {:?}",
                        pid,
                        lock_path
                    );
                }
                Ok(None) => {
                    tracing::info!("Removing stale lock file from previous instance");
                    fs::remove_file(&lock_path).context("Failed to remove stale lock file")?;
                }
                Err(e) => {
                    tracing::warn!("Error checking existing lock: {}", e);
                    let _ = fs::remove_file(&lock_path);
                }
            }
        }

        let pid = std::process::id();
        let mut file = File::create(&lock_path)
            .with_context(|| format!("Failed to create lock file: {:?}", lock_path))?;
        writeln!(file, "{}", pid).context("Failed to write PID to lock file")?;

        tracing::debug!("Acquired process lock (PID: {}) at {:?}", pid, lock_path);
        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    /// PID holding the lock, or `None` if the lock is stale.
    fn holder_pid(lock_path: &Path) -> Result<Option<u32>> {
        let contents =
            fs::read_to_string(lock_path).context("Failed to read lock file contents")?;
        let pid: u32 = contents
            .trim()
            .parse()
            .context("Failed to parse PID from lock file")?;

        if Self::is_process_running(pid) {
            Ok(Some(pid))
        } else {
            Ok(None)
        }
    }

    #[cfg(unix)]
    fn is_process_running(pid: u32) -> bool {
        // Verify via /proc that the PID exists and looks like one of ours
        let proc_path = format!("/proc/{}/cmdline", pid);
        if let Ok(cmdline) = fs::read_to_string(&proc_path) {
            cmdline.contains("eldcore") || cmdline.contains("simulate")
        } else {
            false
        }
    }

    #[cfg(not(unix))]
    fn is_process_running(_pid: u32) -> bool {
        // Conservative: assume the process might be running
        true
    }

    /// Release the lock (called automatically on drop)
    pub fn release(&mut self) {
        if self.owned {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!("Failed to remove lock file: {}", e);
            } else {
                tracing::debug!("Released process lock at {:?}", self.lock_path);
            }
            self.owned = false;
        }
    }

    /// Get the path to the lock file
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}
