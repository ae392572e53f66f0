//! State directory access
//!
//! One file per action at `<state_dir>/<action>.json`. Writes go to a
//! unique temp file first and are renamed into place, so a concurrent
//! reader sees either the old record or the new one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::StateError;
use crate::lock::{StateLock, DEFAULT_LOCK_TIMEOUT};
use crate::record::RunStateRecord;
use crate::STATE_FILE_EXTENSION;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Handle on a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state file for `action`.
    pub fn path(&self, action: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", action, STATE_FILE_EXTENSION))
    }

    /// Path of the lock file guarding read-modify-write cycles on `action`.
    pub fn lock_path(&self, action: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}.lock", action, STATE_FILE_EXTENSION))
    }

    /// Read the record for `action`.
    ///
    /// `Ok(None)` means the action has never been run, which is different
    /// from a record with no hosts.
    pub fn read(&self, action: &str) -> Result<Option<RunStateRecord>, StateError> {
        let path = self.path(action);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(&path, e)),
        };
        RunStateRecord::from_json(&json)
            .map(Some)
            .map_err(|e| StateError::json(&path, e))
    }

    /// Replace the record for `action` atomically (write-then-rename).
    pub fn write(&self, action: &str, record: &RunStateRecord) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir).map_err(|e| StateError::io(&self.dir, e))?;

        let path = self.path(action);
        let json = record.to_json().map_err(|e| StateError::json(&path, e))?;

        let temp_path = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            action,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = fs::write(&temp_path, json) {
            let _ = fs::remove_file(&temp_path);
            return Err(StateError::io(&temp_path, e));
        }
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StateError::io(&path, e));
        }

        tracing::debug!(path = %path.display(), hosts = record.hosts.len(), "wrote run state");
        Ok(())
    }

    /// Read-modify-write under the action's lock.
    ///
    /// A missing file starts from an empty record. The closure's return
    /// value is handed back after the record is written.
    pub fn update<T, F>(&self, action: &str, f: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut RunStateRecord) -> T,
    {
        fs::create_dir_all(&self.dir).map_err(|e| StateError::io(&self.dir, e))?;
        let _lock = StateLock::acquire(&self.lock_path(action), self.lock_timeout)?;

        let mut record = self.read(action)?.unwrap_or_default();
        let out = f(&mut record);
        self.write(action, &record)?;
        Ok(out)
    }

    /// Remove one host's entry so a following run repopulates it.
    ///
    /// Returns false when there is no state file or no such host; the file
    /// is left untouched in that case.
    pub fn remove_host(&self, action: &str, host: &str) -> Result<bool, StateError> {
        Ok(self.remove_hosts(action, &[host])? == 1)
    }

    /// Remove several hosts in a single locked cycle. Returns how many
    /// entries were actually removed.
    pub fn remove_hosts<S: AsRef<str>>(
        &self,
        action: &str,
        hosts: &[S],
    ) -> Result<usize, StateError> {
        if !self.path(action).exists() {
            return Ok(0);
        }
        let _lock = StateLock::acquire(&self.lock_path(action), self.lock_timeout)?;

        let mut record = match self.read(action)? {
            Some(record) => record,
            None => return Ok(0),
        };

        let mut removed = 0;
        for host in hosts {
            if record.hosts.remove(host.as_ref()).is_some() {
                tracing::debug!(host = host.as_ref(), action, "removed host from run state");
                removed += 1;
            }
        }
        if removed > 0 {
            self.write(action, &record)?;
        }
        Ok(removed)
    }

    /// Delete the state file before a fresh run. Returns false if there was
    /// nothing to delete.
    pub fn unlink(&self, action: &str) -> Result<bool, StateError> {
        let path = self.path(action);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed run state");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }
}
