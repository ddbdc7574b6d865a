use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AutopilotConfig;
use crate::configuration::Configuration;
use crate::deployment::{DeploymentError, DeploymentManager, DeploymentRecord, SlotStore};
use crate::error::ConfigError;
use crate::evaluation::Evaluator;
use crate::ledger::{HistoryEntry, HistoryKind, LedgerError, SqliteLedger};
use crate::locks::{HorizonLocks, LockError};
use crate::monitor::{MonitorReport, MonitorState, PostDeploymentMonitor};
use crate::notify::{deliver, NotificationEvent, Notifier};
use crate::search::{HyperparameterSearcher, RunSummary, SearchError};
use crate::signals::{DriftDetector, HealthProbe, PerformanceMonitor};
use crate::trigger::{TriggerError, TriggerManager, TriggerReport};
use crate::validation::{ConfigValidator, ValidationReport};

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("horizon {0} is not configured")]
    UnknownHorizon(String),
    #[error("a cycle is already running for {horizon}")]
    Busy { horizon: String },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("deployment error: {0}")]
    Deployment(#[from] DeploymentError),
    #[error("lock error: {0}")]
    Lock(LockError),
}

impl From<LockError> for PipelineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy { horizon } => PipelineError::Busy { horizon },
            other => PipelineError::Lock(other),
        }
    }
}

/// Lock file a running cycle holds in each horizon's state directory.
pub const CYCLE_LOCK_FILE: &str = ".cycle.lock";

/// Cycle locks over a state directory, shared by every process using it.
pub fn cycle_locks(config: &AutopilotConfig) -> HorizonLocks {
    HorizonLocks::file_backed(config.state_dir(), CYCLE_LOCK_FILE)
}

/// Terminal outcome of one horizon's cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    NoOp,
    Skipped,
    Rejected,
    Deployed,
    RolledBack,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::NoOp => "no_op",
            CycleStatus::Skipped => "skipped",
            CycleStatus::Rejected => "rejected",
            CycleStatus::Deployed => "deployed",
            CycleStatus::RolledBack => "rolled_back",
            CycleStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Trigger,
    Search,
    SearchExhausted,
    Deployment,
    RollbackFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub horizon: String,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub trigger: Option<TriggerReport>,
    pub run: Option<RunSummary>,
    pub candidate: Option<Configuration>,
    pub validation: Option<ValidationReport>,
    pub deployment: Option<DeploymentRecord>,
    pub monitor: Option<MonitorReport>,
    pub failure: Option<CycleFailure>,
}

impl CycleReport {
    fn new(horizon: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            horizon: horizon.to_string(),
            status: CycleStatus::NoOp,
            started_at,
            finished_at: None,
            detail: None,
            trigger: None,
            run: None,
            candidate: None,
            validation: None,
            deployment: None,
            monitor: None,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOptions {
    /// Optimize regardless of trigger conditions.
    pub force: bool,
}

/// External services the pipeline consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub evaluator: Arc<dyn Evaluator>,
    pub performance: Arc<dyn PerformanceMonitor>,
    pub drift: Arc<dyn DriftDetector>,
    pub health_probe: Arc<dyn HealthProbe>,
    pub notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Outcome of the steps before the terminal bookkeeping.
struct Terminal {
    status: CycleStatus,
    detail: Option<String>,
    failure: Option<CycleFailure>,
}

impl Terminal {
    fn status(status: CycleStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
            failure: None,
        }
    }

    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: CycleStatus::Failed,
            detail: Some(message.clone()),
            failure: Some(CycleFailure { kind, message }),
        }
    }
}

pub struct PipelineOrchestrator {
    config: AutopilotConfig,
    ledger: SqliteLedger,
    trigger: TriggerManager,
    searcher: HyperparameterSearcher,
    validator: ConfigValidator,
    deployments: Arc<DeploymentManager>,
    monitor: PostDeploymentMonitor,
    notifier: Arc<dyn Notifier>,
    in_flight: HorizonLocks,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("ledger", &self.ledger)
            .field("deployments", &self.deployments)
            .field("horizons", &self.config.horizons.len())
            .finish()
    }
}

impl PipelineOrchestrator {
    pub fn new(config: AutopilotConfig, collaborators: Collaborators) -> PipelineResult<Self> {
        config.validate()?;
        let ledger = SqliteLedger::new(config.ledger_path())?;
        ledger.initialize()?;
        let deployments = Arc::new(DeploymentManager::new(
            SlotStore::new(config.state_dir()),
            ledger.clone(),
            collaborators.notifier.clone(),
            config.deployment.clone(),
        ));
        let trigger = TriggerManager::new(
            collaborators.performance,
            collaborators.drift,
            ledger.clone(),
            config.trigger.clone(),
        );
        let searcher = HyperparameterSearcher::new(collaborators.evaluator, config.search.clone());
        let validator = ConfigValidator::new(config.validation.clone());
        let monitor = PostDeploymentMonitor::new(
            collaborators.health_probe,
            deployments.clone(),
            config.monitor.clone(),
        );
        let in_flight = cycle_locks(&config);
        Ok(Self {
            config,
            ledger,
            trigger,
            searcher,
            validator,
            deployments,
            monitor,
            notifier: collaborators.notifier,
            in_flight,
        })
    }

    pub fn config(&self) -> &AutopilotConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SqliteLedger {
        &self.ledger
    }

    pub fn deployments(&self) -> &Arc<DeploymentManager> {
        &self.deployments
    }

    /// Starts the time-fallback clock for a configured horizon.
    pub fn register(&self, horizon: &str, at: DateTime<Utc>) -> PipelineResult<bool> {
        if self.config.horizon(horizon).is_none() {
            return Err(PipelineError::UnknownHorizon(horizon.to_string()));
        }
        let registered = self.ledger.register_horizon(horizon, at)?;
        if registered {
            info!(target: "pipeline", horizon = %horizon, "horizon registered");
        }
        Ok(registered)
    }

    /// Runs every configured horizon concurrently.
    pub async fn run_all(
        &self,
        now: DateTime<Utc>,
        options: CycleOptions,
    ) -> Vec<PipelineResult<CycleReport>> {
        let cycles = self
            .config
            .horizons
            .iter()
            .map(|h| self.run_cycle(&h.name, now, options));
        join_all(cycles).await
    }

    pub async fn run_cycle(
        &self,
        horizon: &str,
        now: DateTime<Utc>,
        options: CycleOptions,
    ) -> PipelineResult<CycleReport> {
        if self.config.horizon(horizon).is_none() {
            return Err(PipelineError::UnknownHorizon(horizon.to_string()));
        }
        let _guard = self.in_flight.try_acquire(horizon)?;

        let mut report = CycleReport::new(horizon, now);
        info!(
            target: "pipeline",
            horizon = %horizon,
            cycle_id = %report.cycle_id,
            force = options.force,
            "cycle started"
        );
        let terminal = self.execute(&mut report, now, options).await;
        Ok(self.finish(report, terminal).await)
    }

    async fn execute(
        &self,
        report: &mut CycleReport,
        now: DateTime<Utc>,
        options: CycleOptions,
    ) -> Terminal {
        let horizon = report.horizon.clone();
        let horizon = horizon.as_str();
        let space = match self.config.horizon(horizon) {
            Some(plan) => plan.search_space.clone(),
            None => return Terminal::failed(FailureKind::Trigger, "horizon is not configured"),
        };

        let trigger = match self.trigger.evaluate(horizon, now).await {
            Ok(trigger) if options.force => trigger.forced(),
            Ok(trigger) => trigger,
            Err(TriggerError::NoHistory { .. }) if options.force => {
                TriggerReport::on_demand(horizon, now)
            }
            Err(err @ TriggerError::NoHistory { .. }) => {
                warn!(target: "pipeline", horizon = %horizon, error = %err, "skipping horizon");
                return Terminal::status(CycleStatus::Skipped, err.to_string());
            }
            Err(err) => return Terminal::failed(FailureKind::Trigger, err.to_string()),
        };
        self.record(horizon, HistoryKind::Trigger, &trigger, now);
        let should_optimize = trigger.should_optimize;
        let reasons = trigger.reasons.clone();
        report.trigger = Some(trigger);
        if !should_optimize {
            return Terminal::status(CycleStatus::NoOp, "no trigger condition met");
        }
        deliver(
            self.notifier.as_ref(),
            NotificationEvent::OptimizationTriggered {
                horizon: horizon.to_string(),
                reasons,
                at: now,
            },
        )
        .await;

        let run = match self.searcher.search(horizon, &space, now).await {
            Ok(run) => run,
            Err(err) => return Terminal::failed(FailureKind::Search, err.to_string()),
        };
        let summary = run.summary();
        self.record(horizon, HistoryKind::Run, &summary, now);
        report.run = Some(summary);

        let candidate = match run.best_configuration(now) {
            Ok(candidate) => candidate,
            Err(err @ SearchError::Exhausted { .. }) => {
                error!(target: "pipeline", horizon = %horizon, error = %err, "search exhausted");
                return Terminal::failed(FailureKind::SearchExhausted, err.to_string());
            }
            Err(err) => return Terminal::failed(FailureKind::Search, err.to_string()),
        };
        report.candidate = Some(candidate.clone());

        let baseline = match self.deployments.active(horizon) {
            Ok(active) => active,
            Err(err) => return Terminal::failed(FailureKind::Deployment, err.to_string()),
        };
        let baseline = match baseline {
            Some(active) => Some(self.rescore_baseline(&active, &run.window).await),
            None => None,
        };

        let validation = self.validator.validate(&candidate, baseline.as_ref());
        self.record(horizon, HistoryKind::Validation, &validation, now);
        let approved = validation.approved;
        let event = if approved {
            NotificationEvent::ValidationPassed {
                horizon: horizon.to_string(),
                candidate_id: validation.candidate_id.clone(),
                baseline_id: validation.baseline_id.clone(),
            }
        } else {
            NotificationEvent::ValidationFailed {
                horizon: horizon.to_string(),
                candidate_id: validation.candidate_id.clone(),
                baseline_id: validation.baseline_id.clone(),
                reasons: validation.rejection_reasons.clone(),
            }
        };
        let rejection = validation.rejection_reasons.join(", ");
        report.validation = Some(validation);
        deliver(self.notifier.as_ref(), event).await;
        if !approved {
            return Terminal::status(CycleStatus::Rejected, format!("rejected: {rejection}"));
        }

        let record = match self.deployments.deploy(&candidate).await {
            Ok(record) => record,
            Err(err) => {
                error!(target: "pipeline", horizon = %horizon, error = %err, "deployment failed");
                return Terminal::failed(FailureKind::Deployment, err.to_string());
            }
        };
        self.record(horizon, HistoryKind::Deployment, &record, now);
        report.deployment = Some(record);

        let observed = self.monitor.observe(horizon, self.monitor.default_window()).await;
        self.record(horizon, HistoryKind::Monitor, &observed, now);
        let state = observed.state;
        let monitor_error = observed.error.clone();
        report.monitor = Some(observed);
        match state {
            MonitorState::RolledBack => Terminal::status(
                CycleStatus::RolledBack,
                "health degraded after deployment; previous configuration restored",
            ),
            MonitorState::RollbackFailed => Terminal::failed(
                FailureKind::RollbackFailed,
                monitor_error.unwrap_or_else(|| "automatic rollback failed".to_string()),
            ),
            MonitorState::Passed | MonitorState::Observing => {
                Terminal::status(CycleStatus::Deployed, format!("deployed {}", candidate.short_id()))
            }
        }
    }

    /// Scores the active configuration on the candidate's window so both are
    /// compared on the same data. Falls back to stored metrics.
    async fn rescore_baseline(
        &self,
        active: &Configuration,
        window: &crate::evaluation::BacktestWindow,
    ) -> Configuration {
        match self
            .searcher
            .evaluate_one(&active.horizon, &active.hyperparameters, window)
            .await
        {
            Ok(metrics) => active.with_metrics(metrics),
            Err(err) => {
                warn!(
                    target: "pipeline",
                    horizon = %active.horizon,
                    baseline = %active.short_id(),
                    error = %err,
                    "baseline re-scoring failed; using stored metrics"
                );
                active.clone()
            }
        }
    }

    async fn finish(&self, mut report: CycleReport, terminal: Terminal) -> CycleReport {
        report.status = terminal.status;
        report.detail = terminal.detail;
        report.failure = terminal.failure;
        report.finished_at = Some(Utc::now());

        let horizon = report.horizon.clone();
        self.record(
            &horizon,
            HistoryKind::Cycle,
            &serde_json::json!({
                "cycle_id": report.cycle_id,
                "status": report.status,
                "detail": report.detail,
                "failure": report.failure,
            }),
            report.started_at,
        );

        match report.status {
            CycleStatus::Failed => error!(
                target: "pipeline",
                horizon = %horizon,
                cycle_id = %report.cycle_id,
                detail = report.detail.as_deref().unwrap_or(""),
                "cycle failed"
            ),
            CycleStatus::RolledBack => error!(
                target: "pipeline",
                horizon = %horizon,
                cycle_id = %report.cycle_id,
                "cycle ended with automatic rollback"
            ),
            status => info!(
                target: "pipeline",
                horizon = %horizon,
                cycle_id = %report.cycle_id,
                status = status.as_str(),
                "cycle finished"
            ),
        }

        deliver(
            self.notifier.as_ref(),
            NotificationEvent::CycleFinished {
                horizon,
                cycle_id: report.cycle_id.clone(),
                status: report.status,
                detail: report.detail.clone(),
            },
        )
        .await;
        report
    }

    fn record<T: Serialize>(&self, horizon: &str, kind: HistoryKind, payload: &T, at: DateTime<Utc>) {
        let appended = HistoryEntry::new(horizon, kind, payload, at)
            .and_then(|entry| self.ledger.append_history(&entry));
        if let Err(err) = appended {
            error!(
                target: "pipeline",
                horizon = %horizon,
                kind = kind.as_str(),
                error = %err,
                "failed to append optimization history"
            );
        }
    }
}
