pub mod adapters;
pub mod config;
pub mod configuration;
pub mod deployment;
mod duration_serde;
pub mod error;
pub mod evaluation;
pub mod ledger;
pub mod locks;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod search;
pub mod signals;
mod sqlite;
pub mod trigger;
pub mod validation;

pub use adapters::{
    CommandDriftDetector, CommandEvaluator, CommandExecutor, CommandHealthProbe,
    CommandPerformanceMonitor, SystemCommandExecutor,
};
pub use config::{
    load_autopilot_config, AutopilotConfig, CollaboratorsSection, CommandSpec, DeploymentSection,
    HorizonSection, MonitorSection, PathsSection, SearchSection, TriggerSection, ValidationSection,
};
pub use configuration::{Configuration, Hyperparameters, SeasonalityMode};
pub use deployment::{
    BackupRef, DeploymentError, DeploymentManager, DeploymentOutcome, DeploymentRecord,
    DeploymentResult, RollbackCause, SlotStore, DEPLOY_LOCK_FILE,
};
pub use error::{ConfigError, Result};
pub use evaluation::{BacktestMetrics, BacktestWindow, EvaluationError, EvaluationResult, Evaluator};
pub use ledger::{
    HistoryEntry, HistoryKind, LedgerEntry, LedgerError, LedgerResult, SqliteLedger,
    SqliteLedgerBuilder,
};
pub use locks::{HorizonGuard, HorizonLocks, LockError};
pub use monitor::{MonitorReport, MonitorState, PostDeploymentMonitor, ProbeOutcome};
pub use notify::{BroadcastNotifier, NotificationEvent, Notifier, NotifyError, TracingNotifier};
pub use pipeline::{
    cycle_locks, Collaborators, CycleFailure, CycleOptions, CycleReport, CycleStatus,
    FailureKind, PipelineError, PipelineOrchestrator, PipelineResult, CYCLE_LOCK_FILE,
};
pub use search::{
    CandidateFailure, CandidateScore, HyperparameterSearcher, OptimizationRun, RunSummary,
    SearchCompletion, SearchError, SearchResult, SearchSpace,
};
pub use signals::{
    DriftDetector, DriftSeverity, DriftSignal, HealthProbe, HealthStatus, PerformanceMonitor,
    PerformanceSignal, SignalError, SignalResult,
};
pub use trigger::{TriggerError, TriggerManager, TriggerReason, TriggerReport, TriggerResult};
pub use validation::{ConfigValidator, Criterion, CriterionResult, ValidationReport};
