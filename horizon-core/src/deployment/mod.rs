mod slot;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DeploymentSection;
use crate::configuration::{is_valid_horizon_name, Configuration};
use crate::ledger::{LedgerError, SqliteLedger};
use crate::locks::{HorizonGuard, HorizonLocks, LockError};
use crate::notify::{deliver, NotificationEvent, Notifier};

pub use slot::{BackupRef, SlotStore};

/// Lock file held in `<slot root>/<horizon>/` while a transition runs.
pub const DEPLOY_LOCK_FILE: &str = ".lock";

pub type DeploymentResult<T> = std::result::Result<T, DeploymentError>;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("a deployment or rollback is already in flight for {horizon}")]
    Busy { horizon: String },
    #[error("no backup available to roll back {horizon}")]
    NoBackup { horizon: String },
    #[error("invalid horizon name {0:?}")]
    InvalidHorizon(String),
    #[error("configuration {config_id} is already active for {horizon}")]
    AlreadyActive { horizon: String, config_id: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOutcome {
    Deployed,
    RolledBack,
}

impl DeploymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentOutcome::Deployed => "deployed",
            DeploymentOutcome::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentOutcome {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deployed" => Ok(Self::Deployed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(LedgerError::InvalidValue(format!("deployment outcome {other}"))),
        }
    }
}

/// One old→new transition of a horizon's active slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub deployment_id: String,
    pub horizon: String,
    pub deployed_config_id: String,
    pub previous_config_id: Option<String>,
    pub backup_ref: Option<String>,
    pub deployed_at: DateTime<Utc>,
    pub outcome: DeploymentOutcome,
    pub rollback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackCause {
    Manual { reason: String },
    HealthDegraded { consecutive_failures: u32 },
}

impl RollbackCause {
    pub fn is_automatic(&self) -> bool {
        matches!(self, RollbackCause::HealthDegraded { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            RollbackCause::Manual { reason } => format!("manual: {reason}"),
            RollbackCause::HealthDegraded {
                consecutive_failures,
            } => format!("health degraded after {consecutive_failures} consecutive failed probes"),
        }
    }
}

pub struct DeploymentManager {
    slots: SlotStore,
    ledger: SqliteLedger,
    notifier: Arc<dyn Notifier>,
    locks: HorizonLocks,
    config: DeploymentSection,
}

impl fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("slots", &self.slots)
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish()
    }
}

impl DeploymentManager {
    pub fn new(
        slots: SlotStore,
        ledger: SqliteLedger,
        notifier: Arc<dyn Notifier>,
        config: DeploymentSection,
    ) -> Self {
        let locks = HorizonLocks::file_backed(slots.root(), DEPLOY_LOCK_FILE);
        Self {
            slots,
            ledger,
            notifier,
            locks,
            config,
        }
    }

    pub fn ledger(&self) -> &SqliteLedger {
        &self.ledger
    }

    pub fn slots(&self) -> &SlotStore {
        &self.slots
    }

    /// Currently active configuration. Reads the slot file without locking;
    /// the atomic rename guarantees a complete document.
    pub fn active(&self, horizon: &str) -> DeploymentResult<Option<Configuration>> {
        self.slots.read_active(horizon)
    }

    pub fn backups(&self, horizon: &str) -> DeploymentResult<Vec<BackupRef>> {
        self.slots.list_backups(horizon)
    }

    /// Exclusive deploy/rollback lock for a horizon, shared with every
    /// manager over the same slot root.
    pub fn try_lock(&self, horizon: &str) -> DeploymentResult<HorizonGuard> {
        if !is_valid_horizon_name(horizon) {
            return Err(DeploymentError::InvalidHorizon(horizon.to_string()));
        }
        self.locks.try_acquire(horizon).map_err(|err| match err {
            LockError::Busy { horizon } => DeploymentError::Busy { horizon },
            LockError::Io { path, source } => DeploymentError::Io { path, source },
        })
    }

    pub async fn deploy(&self, candidate: &Configuration) -> DeploymentResult<DeploymentRecord> {
        let horizon = candidate.horizon.clone();
        if !is_valid_horizon_name(&horizon) {
            return Err(DeploymentError::InvalidHorizon(horizon));
        }
        let _guard = self.try_lock(&horizon)?;

        let slots = self.slots.clone();
        let ledger = self.ledger.clone();
        let candidate = candidate.clone();
        let retention = self.config.backup_retention;
        let record =
            tokio::task::spawn_blocking(move || deploy_blocking(&slots, &ledger, &candidate, retention))
                .await??;

        info!(
            target: "deployment",
            horizon = %record.horizon,
            deployment_id = %record.deployment_id,
            config_id = %record.deployed_config_id,
            previous = record.previous_config_id.as_deref().unwrap_or("none"),
            "configuration deployed"
        );
        deliver(
            self.notifier.as_ref(),
            NotificationEvent::DeploymentSucceeded {
                horizon: record.horizon.clone(),
                deployment_id: record.deployment_id.clone(),
                config_id: record.deployed_config_id.clone(),
                previous_config_id: record.previous_config_id.clone(),
            },
        )
        .await;
        Ok(record)
    }

    pub async fn rollback(
        &self,
        horizon: &str,
        cause: RollbackCause,
    ) -> DeploymentResult<DeploymentRecord> {
        if !is_valid_horizon_name(horizon) {
            return Err(DeploymentError::InvalidHorizon(horizon.to_string()));
        }
        let _guard = self.try_lock(horizon)?;

        let slots = self.slots.clone();
        let ledger = self.ledger.clone();
        let owned_horizon = horizon.to_string();
        let reason = cause.describe();
        let record = tokio::task::spawn_blocking(move || {
            rollback_blocking(&slots, &ledger, &owned_horizon, reason)
        })
        .await??;

        error!(
            target: "deployment",
            horizon = %horizon,
            deployment_id = %record.deployment_id,
            restored = %record.deployed_config_id,
            superseded = record.previous_config_id.as_deref().unwrap_or("none"),
            automatic = cause.is_automatic(),
            "configuration rolled back"
        );
        deliver(
            self.notifier.as_ref(),
            NotificationEvent::RolledBack {
                horizon: horizon.to_string(),
                deployment_id: record.deployment_id.clone(),
                restored_config_id: record.deployed_config_id.clone(),
                reason: cause.describe(),
                automatic: cause.is_automatic(),
            },
        )
        .await;
        Ok(record)
    }
}

fn deploy_blocking(
    slots: &SlotStore,
    ledger: &SqliteLedger,
    candidate: &Configuration,
    retention: usize,
) -> DeploymentResult<DeploymentRecord> {
    let horizon = candidate.horizon.as_str();
    let previous = slots.read_active(horizon)?;
    if previous.as_ref().is_some_and(|p| p.id == candidate.id) {
        return Err(DeploymentError::AlreadyActive {
            horizon: horizon.to_string(),
            config_id: candidate.id.clone(),
        });
    }

    ledger.record_configuration(candidate)?;
    if let Some(previous) = &previous {
        ledger.record_configuration(previous)?;
    }

    let backup = previous
        .as_ref()
        .map(|p| slots.backup(horizon, p))
        .transpose()?;

    if let Err(err) = slots.write_active(horizon, candidate) {
        discard_backup(slots, horizon, backup.as_ref());
        return Err(err);
    }

    let record = DeploymentRecord {
        deployment_id: Uuid::new_v4().to_string(),
        horizon: horizon.to_string(),
        deployed_config_id: candidate.id.clone(),
        previous_config_id: previous.as_ref().map(|p| p.id.clone()),
        backup_ref: backup.as_ref().map(|b| b.file_name.clone()),
        deployed_at: Utc::now(),
        outcome: DeploymentOutcome::Deployed,
        rollback_reason: None,
    };

    if let Err(err) = ledger.append_deployment(&record) {
        restore_slot(slots, horizon, previous.as_ref());
        discard_backup(slots, horizon, backup.as_ref());
        return Err(err.into());
    }

    // The transition is committed; a failed prune only leaves extra backups.
    match slots.prune_backups(horizon, retention) {
        Ok(pruned) if !pruned.is_empty() => info!(
            target: "deployment",
            horizon = %horizon,
            pruned = pruned.len(),
            retention,
            "pruned old backups"
        ),
        Ok(_) => {}
        Err(err) => warn!(
            target: "deployment",
            horizon = %horizon,
            error = %err,
            "failed to prune old backups"
        ),
    }
    Ok(record)
}

/// Drops the snapshot taken by a deployment that did not commit.
fn discard_backup(slots: &SlotStore, horizon: &str, backup: Option<&BackupRef>) {
    let Some(backup) = backup else {
        return;
    };
    if let Err(err) = slots.remove_backup(backup) {
        warn!(
            target: "deployment",
            horizon = %horizon,
            backup = %backup.file_name,
            error = %err,
            "failed to discard backup of aborted deployment"
        );
    }
}

fn rollback_blocking(
    slots: &SlotStore,
    ledger: &SqliteLedger,
    horizon: &str,
    reason: String,
) -> DeploymentResult<DeploymentRecord> {
    let backup = slots
        .latest_backup(horizon)?
        .ok_or_else(|| DeploymentError::NoBackup {
            horizon: horizon.to_string(),
        })?;
    let restored = slots.read_backup(&backup)?;
    let current = slots.read_active(horizon)?;

    ledger.record_configuration(&restored)?;
    slots.write_active(horizon, &restored)?;

    let record = DeploymentRecord {
        deployment_id: Uuid::new_v4().to_string(),
        horizon: horizon.to_string(),
        deployed_config_id: restored.id.clone(),
        previous_config_id: current.as_ref().map(|c| c.id.clone()),
        backup_ref: Some(backup.file_name.clone()),
        deployed_at: Utc::now(),
        outcome: DeploymentOutcome::RolledBack,
        rollback_reason: Some(reason),
    };

    if let Err(err) = ledger.append_deployment(&record) {
        restore_slot(slots, horizon, current.as_ref());
        return Err(err.into());
    }
    slots.remove_backup(&backup)?;
    Ok(record)
}

/// Puts the slot back the way it was before an aborted transition.
fn restore_slot(slots: &SlotStore, horizon: &str, previous: Option<&Configuration>) {
    let restored = match previous {
        Some(previous) => slots.write_active(horizon, previous),
        None => slots.clear_active(horizon),
    };
    if let Err(err) = restored {
        error!(
            target: "deployment",
            horizon = %horizon,
            error = %err,
            "failed to restore active slot after ledger failure"
        );
    }
}
