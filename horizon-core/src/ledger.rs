//! Append-only SQLite ledger: configuration registry, deployment transitions
//! and optimization history per horizon.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::configuration::Configuration;
use crate::deployment::{DeploymentOutcome, DeploymentRecord};
use crate::sqlite::configure_connection;

const LEDGER_SCHEMA: &str = include_str!("../../sql/ledger.sql");

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("ledger path not configured")]
    MissingStore,
    #[error("failed to open ledger at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("invalid ledger value: {0}")]
    InvalidValue(String),
    #[error("ledger for {horizon} is inconsistent at seq {seq}: {detail}")]
    Inconsistent {
        horizon: String,
        seq: i64,
        detail: String,
    },
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Registered,
    Trigger,
    Run,
    Validation,
    Deployment,
    Monitor,
    Cycle,
}

impl HistoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Registered => "registered",
            HistoryKind::Trigger => "trigger",
            HistoryKind::Run => "run",
            HistoryKind::Validation => "validation",
            HistoryKind::Deployment => "deployment",
            HistoryKind::Monitor => "monitor",
            HistoryKind::Cycle => "cycle",
        }
    }
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HistoryKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "trigger" => Ok(Self::Trigger),
            "run" => Ok(Self::Run),
            "validation" => Ok(Self::Validation),
            "deployment" => Ok(Self::Deployment),
            "monitor" => Ok(Self::Monitor),
            "cycle" => Ok(Self::Cycle),
            other => Err(LedgerError::InvalidValue(format!("history kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Option<i64>,
    pub horizon: String,
    pub kind: HistoryKind,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new<T: Serialize>(
        horizon: impl Into<String>,
        kind: HistoryKind,
        payload: &T,
        recorded_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        Ok(Self {
            id: None,
            horizon: horizon.into(),
            kind,
            payload: serde_json::to_value(payload)?,
            recorded_at,
        })
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, DateTime<Utc>)> {
        Ok((
            row.get("id")?,
            row.get("horizon")?,
            row.get("kind")?,
            row.get("payload")?,
            row.get("recorded_at")?,
        ))
    }
}

/// A transition as stored, with its position in the per-ledger order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: i64,
    #[serde(flatten)]
    pub record: DeploymentRecord,
}

#[derive(Debug, Clone)]
pub struct SqliteLedgerBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteLedgerBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteLedgerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> LedgerResult<SqliteLedger> {
        let path = self.path.ok_or(LedgerError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        let create = !self.read_only && self.create_if_missing;
        if create {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(SqliteLedger { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteLedger {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteLedger {
    pub fn builder() -> SqliteLedgerBuilder {
        SqliteLedgerBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> LedgerResult<Self> {
        SqliteLedgerBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> LedgerResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            LedgerError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| LedgerError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> LedgerResult<()> {
        let conn = self.open()?;
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(())
    }

    /// Stores the configuration unless a record with the same id exists.
    pub fn record_configuration(&self, configuration: &Configuration) -> LedgerResult<bool> {
        let conn = self.open()?;
        let payload = serde_json::to_string(configuration)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO configurations (config_id, horizon, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &configuration.id,
                &configuration.horizon,
                payload,
                configuration.created_at,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn fetch_configuration(&self, config_id: &str) -> LedgerResult<Option<Configuration>> {
        let conn = self.open()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM configurations WHERE config_id = ?1",
                [config_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|raw| serde_json::from_str(&raw).map_err(LedgerError::from))
            .transpose()
    }

    pub fn append_deployment(&self, record: &DeploymentRecord) -> LedgerResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO transitions (
                deployment_id, horizon, outcome, previous_config_id, deployed_config_id,
                backup_ref, rollback_reason, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &record.deployment_id,
                &record.horizon,
                record.outcome.as_str(),
                &record.previous_config_id,
                &record.deployed_config_id,
                &record.backup_ref,
                &record.rollback_reason,
                record.deployed_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Transitions for a horizon in ledger order; `limit` keeps the most recent.
    pub fn deployments(&self, horizon: &str, limit: Option<usize>) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT seq, deployment_id, horizon, outcome, previous_config_id,
                       deployed_config_id, backup_ref, rollback_reason, recorded_at
                FROM transitions
                WHERE horizon = ?1
                ORDER BY seq DESC
                LIMIT ?2
             ) ORDER BY seq ASC",
        )?;
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(params![horizon, limit], ledger_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    pub fn last_deployment(&self, horizon: &str) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self.deployments(horizon, Some(1))?.pop())
    }

    /// Replays the transition chain and returns the configuration it leaves
    /// active. Each transition must start from the configuration the previous
    /// one activated.
    pub fn replay_active(&self, horizon: &str) -> LedgerResult<Option<String>> {
        let mut active: Option<String> = None;
        for entry in self.deployments(horizon, None)? {
            if entry.record.previous_config_id != active {
                return Err(LedgerError::Inconsistent {
                    horizon: horizon.to_string(),
                    seq: entry.seq,
                    detail: format!(
                        "transition starts from {:?} but {:?} was active",
                        entry.record.previous_config_id, active
                    ),
                });
            }
            active = Some(entry.record.deployed_config_id);
        }
        Ok(active)
    }

    pub fn append_history(&self, entry: &HistoryEntry) -> LedgerResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO optimization_history (horizon, kind, payload, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                &entry.horizon,
                entry.kind.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.recorded_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn history(&self, horizon: &str, limit: Option<usize>) -> LedgerResult<Vec<HistoryEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                SELECT id, horizon, kind, payload, recorded_at
                FROM optimization_history
                WHERE horizon = ?1
                ORDER BY id DESC
                LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(params![horizon, limit], HistoryEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, horizon, kind, payload, recorded_at)| {
                Ok(HistoryEntry {
                    id: Some(id),
                    horizon,
                    kind: kind.parse()?,
                    payload: serde_json::from_str(&payload)?,
                    recorded_at,
                })
            })
            .collect()
    }

    pub fn last_recorded(&self, horizon: &str, kind: HistoryKind) -> LedgerResult<Option<DateTime<Utc>>> {
        let conn = self.open()?;
        let at = conn
            .query_row(
                "SELECT recorded_at FROM optimization_history
                 WHERE horizon = ?1 AND kind = ?2
                 ORDER BY id DESC LIMIT 1",
                params![horizon, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(at)
    }

    pub fn last_optimization_at(&self, horizon: &str) -> LedgerResult<Option<DateTime<Utc>>> {
        self.last_recorded(horizon, HistoryKind::Run)
    }

    pub fn registered_at(&self, horizon: &str) -> LedgerResult<Option<DateTime<Utc>>> {
        self.last_recorded(horizon, HistoryKind::Registered)
    }

    /// Starts a horizon's history. Returns `false` if it was already registered.
    pub fn register_horizon(&self, horizon: &str, at: DateTime<Utc>) -> LedgerResult<bool> {
        if self.registered_at(horizon)?.is_some() {
            return Ok(false);
        }
        let entry = HistoryEntry::new(
            horizon,
            HistoryKind::Registered,
            &serde_json::json!({ "horizon": horizon }),
            at,
        )?;
        self.append_history(&entry)?;
        Ok(true)
    }

    pub fn horizons(&self) -> LedgerResult<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT horizon FROM transitions
             UNION
             SELECT horizon FROM optimization_history
             ORDER BY horizon",
        )?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }
}

fn ledger_entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerResult<LedgerEntry>> {
    let seq: i64 = row.get("seq")?;
    let outcome: String = row.get("outcome")?;
    let record = DeploymentRecord {
        deployment_id: row.get("deployment_id")?,
        horizon: row.get("horizon")?,
        deployed_config_id: row.get("deployed_config_id")?,
        previous_config_id: row.get("previous_config_id")?,
        backup_ref: row.get("backup_ref")?,
        deployed_at: row.get("recorded_at")?,
        outcome: DeploymentOutcome::Deployed,
        rollback_reason: row.get("rollback_reason")?,
    };
    Ok(outcome
        .parse::<DeploymentOutcome>()
        .map(|outcome| LedgerEntry {
            seq,
            record: DeploymentRecord { outcome, ..record },
        }))
}
