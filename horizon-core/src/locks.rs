use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{horizon} is locked by another operation")]
    Busy { horizon: String },
    #[error("lock file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Arena of per-horizon exclusive locks.
///
/// Acquisition never waits: a held lock means another operation on the same
/// horizon is in flight and the caller reports it as busy. A file-backed
/// arena also takes an advisory lock on `<root>/<horizon>/<file>`, which
/// extends the exclusion to other processes sharing the state directory.
#[derive(Debug, Default)]
pub struct HorizonLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    lock_file: Option<(PathBuf, String)>,
}

/// Held for the duration of one operation on a horizon.
#[derive(Debug)]
pub struct HorizonGuard {
    horizon: String,
    file: Option<File>,
    _guard: OwnedMutexGuard<()>,
}

impl HorizonGuard {
    pub fn horizon(&self) -> &str {
        &self.horizon
    }
}

impl Drop for HorizonGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            // Closing the descriptor releases the lock as well.
            let _ = FileExt::unlock(&file);
        }
    }
}

impl HorizonLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_backed(root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            slots: Mutex::default(),
            lock_file: Some((root.into(), file_name.into())),
        }
    }

    pub fn lock_path(&self, horizon: &str) -> Option<PathBuf> {
        self.lock_file
            .as_ref()
            .map(|(root, name)| root.join(horizon).join(name))
    }

    fn slot(&self, horizon: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(horizon.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn try_acquire(&self, horizon: &str) -> Result<HorizonGuard, LockError> {
        let busy = || LockError::Busy {
            horizon: horizon.to_string(),
        };
        let guard = self.slot(horizon).try_lock_owned().map_err(|_| busy())?;
        let file = match self.lock_path(horizon) {
            Some(path) => Some(lock_file(&path)?.ok_or_else(busy)?),
            None => None,
        };
        Ok(HorizonGuard {
            horizon: horizon.to_string(),
            file,
            _guard: guard,
        })
    }

    pub fn is_held(&self, horizon: &str) -> bool {
        self.slot(horizon).try_lock().is_err()
    }
}

/// `Ok(None)` when another descriptor holds the lock.
fn lock_file(path: &Path) -> Result<Option<File>, LockError> {
    let io_error = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_error)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(err) => Err(io_error(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = HorizonLocks::new();
        let guard = locks.try_acquire("daily").expect("first acquire");
        assert_eq!(guard.horizon(), "daily");
        assert!(matches!(locks.try_acquire("daily"), Err(LockError::Busy { .. })));
        assert!(locks.is_held("daily"));
        drop(guard);
        assert!(!locks.is_held("daily"));
        assert!(locks.try_acquire("daily").is_ok());
    }

    #[test]
    fn horizons_lock_independently() {
        let locks = HorizonLocks::new();
        let _daily = locks.try_acquire("daily").unwrap();
        assert!(locks.try_acquire("weekly").is_ok());
    }

    #[test]
    fn file_backed_arenas_exclude_each_other() {
        let dir = TempDir::new().unwrap();
        let first = HorizonLocks::file_backed(dir.path(), ".lock");
        let second = HorizonLocks::file_backed(dir.path(), ".lock");

        let guard = first.try_acquire("daily").unwrap();
        assert!(dir.path().join("daily").join(".lock").exists());
        assert!(matches!(
            second.try_acquire("daily"),
            Err(LockError::Busy { horizon }) if horizon == "daily"
        ));
        assert!(!second.is_held("daily"));
        assert!(second.try_acquire("weekly").is_ok());

        drop(guard);
        assert!(second.try_acquire("daily").is_ok());
    }
}
