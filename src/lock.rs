//! Single-writer advisory lock over the plugin directory.
//!
//! A sentinel file under `plugins_path` marks an in-flight writer. Acquisition
//! polls for up to `lock_wait`; a sentinel older than `lock_stale` belongs to
//! a crashed owner and is stolen. This is a single-node mechanism: it
//! serialises writers on one filesystem, nothing more.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use tokio::time::Instant;

use crate::error::PluginError;
use crate::runtime::Runtime;

/// Name of the sentinel file inside `plugins_path`.
pub const LOCK_FILE: &str = "install.lock";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Factory for store lock guards.
pub struct StoreLock {
    runtime: Arc<dyn Runtime>,
    lock_file: PathBuf,
    wait: Duration,
    stale: Duration,
}

impl StoreLock {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        plugins_path: &std::path::Path,
        wait: Duration,
        stale: Duration,
    ) -> Self {
        StoreLock {
            runtime,
            lock_file: plugins_path.join(LOCK_FILE),
            wait,
            stale,
        }
    }

    /// Path of the sentinel file.
    pub fn lock_file(&self) -> &std::path::Path {
        &self.lock_file
    }

    /// Acquire the lock, polling up to `lock_wait`.
    ///
    /// There is no suspension point between the existence check and the
    /// sentinel write, so acquisition is atomic within one cooperative
    /// scheduler.
    pub async fn acquire(&self) -> Result<LockGuard, PluginError> {
        let deadline = Instant::now() + self.wait;

        loop {
            if self.runtime.exists(&self.lock_file) {
                if self.is_stale() {
                    warn!(
                        "Lock file {:?} is older than {:?}, stealing it",
                        self.lock_file, self.stale
                    );
                    let _ = self.runtime.remove_file(&self.lock_file);
                    continue;
                }
            } else {
                let contents = format!("pid={}\n", std::process::id());
                self.runtime
                    .write(&self.lock_file, contents.as_bytes())
                    .map_err(|e| {
                        PluginError::io(
                            self.lock_file.clone(),
                            std::io::Error::other(e.to_string()),
                        )
                    })?;
                debug!("Acquired store lock {:?}", self.lock_file);
                return Ok(LockGuard {
                    runtime: Arc::clone(&self.runtime),
                    lock_file: self.lock_file.clone(),
                });
            }

            if Instant::now() >= deadline {
                return Err(PluginError::LockBusy {
                    lock_file: self.lock_file.clone(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn is_stale(&self) -> bool {
        match self.runtime.modified(&self.lock_file) {
            Ok(mtime) => match SystemTime::now().duration_since(mtime) {
                Ok(age) => age > self.stale,
                Err(_) => false,
            },
            // Unreadable mtime: the file may have vanished between the
            // existence check and the stat. Let the next poll decide.
            Err(_) => false,
        }
    }
}

/// RAII guard: the sentinel is removed when the guard drops.
pub struct LockGuard {
    runtime: Arc<dyn Runtime>,
    lock_file: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.remove_file(&self.lock_file) {
            warn!("Failed to release store lock {:?}: {}", self.lock_file, e);
        }
    }
}
