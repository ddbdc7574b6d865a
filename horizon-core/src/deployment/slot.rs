use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::configuration::Configuration;

use super::{DeploymentError, DeploymentResult};

const ACTIVE_FILE: &str = "active.json";
const BACKUP_DIR: &str = "backups";
const STAGING_DIR: &str = ".staging";

/// A snapshot in a horizon's backup set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRef {
    pub sequence: u64,
    pub config_id: String,
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// On-disk layout: `<root>/<horizon>/active.json` plus a numbered backup set
/// under `<root>/<horizon>/backups/`.
#[derive(Debug, Clone)]
pub struct SlotStore {
    root: PathBuf,
}

impl SlotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn horizon_dir(&self, horizon: &str) -> PathBuf {
        self.root.join(horizon)
    }

    pub fn active_path(&self, horizon: &str) -> PathBuf {
        self.horizon_dir(horizon).join(ACTIVE_FILE)
    }

    fn backup_dir(&self, horizon: &str) -> PathBuf {
        self.horizon_dir(horizon).join(BACKUP_DIR)
    }

    pub fn read_active(&self, horizon: &str) -> DeploymentResult<Option<Configuration>> {
        read_json(&self.active_path(horizon))
    }

    /// Stages the configuration next to the slot, fsyncs it and renames it
    /// over `active.json`.
    pub fn write_active(&self, horizon: &str, configuration: &Configuration) -> DeploymentResult<()> {
        let target = self.active_path(horizon);
        let staging = self.horizon_dir(horizon).join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|source| io_error(&staging, source))?;

        let temp = NamedTempFile::new_in(&staging).map_err(|source| io_error(&staging, source))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, configuration)?;
            writer.flush().map_err(|source| io_error(temp.path(), source))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|source| io_error(temp.path(), source))?;
        temp.persist(&target)
            .map_err(|err| io_error(&target, err.error))?;
        sync_dir(&self.horizon_dir(horizon));
        Ok(())
    }

    /// Removes the active slot; used to undo a first deployment.
    pub fn clear_active(&self, horizon: &str) -> DeploymentResult<()> {
        let path = self.active_path(horizon);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    pub fn backup(&self, horizon: &str, configuration: &Configuration) -> DeploymentResult<BackupRef> {
        let dir = self.backup_dir(horizon);
        fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        let sequence = self
            .list_backups(horizon)?
            .last()
            .map(|b| b.sequence + 1)
            .unwrap_or(1);
        let file_name = format!("{sequence:010}-{}.json", configuration.id);
        let path = dir.join(&file_name);
        let payload = serde_json::to_vec_pretty(configuration)?;
        fs::write(&path, payload).map_err(|source| io_error(&path, source))?;
        Ok(BackupRef {
            sequence,
            config_id: configuration.id.clone(),
            file_name,
            path,
        })
    }

    /// Backups ordered oldest first.
    pub fn list_backups(&self, horizon: &str) -> DeploymentResult<Vec<BackupRef>> {
        let dir = self.backup_dir(horizon);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&dir, source)),
        };
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&dir, source))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(backup) = parse_backup_name(&file_name, entry.path()) {
                backups.push(backup);
            }
        }
        backups.sort_by_key(|b| b.sequence);
        Ok(backups)
    }

    pub fn latest_backup(&self, horizon: &str) -> DeploymentResult<Option<BackupRef>> {
        Ok(self.list_backups(horizon)?.pop())
    }

    pub fn read_backup(&self, backup: &BackupRef) -> DeploymentResult<Configuration> {
        read_json(&backup.path)?.ok_or_else(|| {
            io_error(
                &backup.path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "backup disappeared"),
            )
        })
    }

    pub fn remove_backup(&self, backup: &BackupRef) -> DeploymentResult<()> {
        fs::remove_file(&backup.path).map_err(|source| io_error(&backup.path, source))
    }

    /// Keeps the newest `keep` backups and returns the ones removed.
    pub fn prune_backups(&self, horizon: &str, keep: usize) -> DeploymentResult<Vec<BackupRef>> {
        let backups = self.list_backups(horizon)?;
        let excess = backups.len().saturating_sub(keep);
        let removed: Vec<BackupRef> = backups.into_iter().take(excess).collect();
        for backup in &removed {
            self.remove_backup(backup)?;
        }
        Ok(removed)
    }
}

fn parse_backup_name(file_name: &str, path: PathBuf) -> Option<BackupRef> {
    let stem = file_name.strip_suffix(".json")?;
    let (sequence, config_id) = stem.split_once('-')?;
    Some(BackupRef {
        sequence: sequence.parse().ok()?,
        config_id: config_id.to_string(),
        file_name: file_name.to_string(),
        path,
    })
}

fn read_json(path: &Path) -> DeploymentResult<Option<Configuration>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(io_error(path, source)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> DeploymentError {
    DeploymentError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
