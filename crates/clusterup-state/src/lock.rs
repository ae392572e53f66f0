//! Advisory lock for read-modify-write cycles on a state file
//!
//! The lock is a sibling file created with `create_new`. Holding it
//! serializes prune/register cycles across processes; plain writes never
//! need it because they are atomic replaces.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::error::StateError;

/// How long to wait for a contended lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// A lock older than this is assumed to belong to a dead process.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Held lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock at `path`, waiting up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, StateError> {
        let deadline = Instant::now() + timeout;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Owner pid is informational only
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        tracing::warn!(lock = %path.display(), "removing stale state lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StateError::LockTimeout {
                            path: path.to_path_buf(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(StateError::io(path, e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_released_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("deploy.json.lock");

        {
            let lock = StateLock::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
            assert!(lock.path().exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_contended_lock_times_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("deploy.json.lock");

        let _held = StateLock::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
        let result = StateLock::acquire(&path, Duration::from_millis(100));
        assert!(matches!(result, Err(StateError::LockTimeout { .. })));
    }

    #[test]
    fn test_lock_acquired_after_release_by_other_thread() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("deploy.json.lock");

        let held = StateLock::acquire(&path, DEFAULT_LOCK_TIMEOUT).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(held);
        });

        let lock = StateLock::acquire(&path, Duration::from_secs(2));
        assert!(lock.is_ok());
        releaser.join().unwrap();
    }
}
