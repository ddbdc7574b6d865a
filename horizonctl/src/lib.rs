use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use horizon_core::{
    cycle_locks, load_autopilot_config, AutopilotConfig, Collaborators, CommandDriftDetector,
    CommandEvaluator, CommandHealthProbe, CommandPerformanceMonitor, CommandSpec, CycleOptions,
    CycleReport, DeploymentManager, DeploymentRecord, HistoryEntry, HistoryKind, LedgerEntry,
    PipelineError, PipelineOrchestrator, RollbackCause, SlotStore, SqliteLedger, TracingNotifier,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] horizon_core::ConfigError),
    #[error("ledger error: {0}")]
    Ledger(#[from] horizon_core::LedgerError),
    #[error("deployment error: {0}")]
    Deployment(#[from] horizon_core::DeploymentError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("horizon {0} is not configured")]
    UnknownHorizon(String),
    #[error("collaborator command missing from config: collaborators.{0}")]
    MissingCollaborator(&'static str),
    #[error("{failed} of {total} cycles did not complete")]
    CyclesFailed { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Forecast horizon autopilot control interface", long_about = None)]
pub struct Cli {
    /// Path to autopilot.toml
    #[arg(long, default_value = "configs/autopilot.toml")]
    pub config: PathBuf,
    /// Overrides paths.base_dir
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Shows active configuration and schedule per horizon
    Status,
    /// Lists deployment transitions for a horizon
    Ledger(HorizonListArgs),
    /// Lists optimization history for a horizon
    History(HorizonListArgs),
    /// Starts the fallback clock for a horizon
    Register(HorizonArgs),
    /// Restores the most recent backup of a horizon
    Rollback(RollbackArgs),
    /// Runs an optimization cycle
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct HorizonArgs {
    #[arg(long)]
    pub horizon: String,
}

#[derive(Args, Debug)]
pub struct HorizonListArgs {
    #[arg(long)]
    pub horizon: String,
    /// Maximum number of rows
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    #[arg(long)]
    pub horizon: String,
    /// Recorded with the transition
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Only this horizon; all configured horizons otherwise
    #[arg(long)]
    pub horizon: Option<String>,
    /// Optimize even when no trigger fires
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let now = Utc::now();

    match &cli.command {
        Commands::Status => {
            let status = context.gather_status()?;
            render(&status, cli.format)?;
        }
        Commands::Ledger(args) => {
            let ledger = context.ledger_list(args)?;
            render(&ledger, cli.format)?;
        }
        Commands::History(args) => {
            let history = context.history_list(args)?;
            render(&history, cli.format)?;
        }
        Commands::Register(args) => {
            let result = context.register(&args.horizon, now)?;
            render(&result, cli.format)?;
        }
        Commands::Rollback(args) => {
            let record = context.rollback(args).await?;
            render(&record, cli.format)?;
        }
        Commands::Run(args) => {
            let cycles = context.run_cycles(args, now).await?;
            render(&cycles, cli.format)?;
            if !cycles.errors.is_empty() {
                return Err(AppError::CyclesFailed {
                    failed: cycles.errors.len(),
                    total: cycles.errors.len() + cycles.reports.len(),
                });
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: AutopilotConfig,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_autopilot_config(&cli.config)?;
        if let Some(base_dir) = &cli.base_dir {
            config.paths.base_dir = base_dir.to_string_lossy().into_owned();
        }
        Ok(Self { config })
    }

    fn ensure_horizon(&self, horizon: &str) -> Result<()> {
        if self.config.horizon(horizon).is_none() {
            return Err(AppError::UnknownHorizon(horizon.to_string()));
        }
        Ok(())
    }

    fn open_ledger(&self) -> Result<SqliteLedger> {
        let ledger = SqliteLedger::new(self.config.ledger_path())?;
        ledger.initialize()?;
        Ok(ledger)
    }

    fn deployment_manager(&self) -> Result<DeploymentManager> {
        Ok(DeploymentManager::new(
            SlotStore::new(self.config.state_dir()),
            self.open_ledger()?,
            Arc::new(TracingNotifier),
            self.config.deployment.clone(),
        ))
    }

    fn gather_status(&self) -> Result<StatusReport> {
        let ledger = self.open_ledger()?;
        let slots = SlotStore::new(self.config.state_dir());
        let mut horizons = Vec::with_capacity(self.config.horizons.len());
        for section in &self.config.horizons {
            let name = section.name.as_str();
            let active = slots.read_active(name)?;
            let backups = slots.list_backups(name)?;
            let last_cycle = ledger
                .history(name, None)?
                .into_iter()
                .rev()
                .find(|entry| entry.kind == HistoryKind::Cycle)
                .and_then(|entry| {
                    entry
                        .payload
                        .get("status")
                        .and_then(|s| s.as_str())
                        .map(str::to_string)
                });
            horizons.push(HorizonStatus {
                horizon: name.to_string(),
                active_config_id: active.as_ref().map(|c| c.id.clone()),
                active_created_at: active.as_ref().map(|c| c.created_at),
                backups: backups.len(),
                registered_at: ledger.registered_at(name)?,
                last_optimization_at: ledger.last_optimization_at(name)?,
                last_cycle_status: last_cycle,
            });
        }
        Ok(StatusReport {
            state_dir: self.config.state_dir().display().to_string(),
            ledger_db: self.config.ledger_path().display().to_string(),
            horizons,
        })
    }

    fn ledger_list(&self, args: &HorizonListArgs) -> Result<LedgerList> {
        self.ensure_horizon(&args.horizon)?;
        let ledger = self.open_ledger()?;
        let rows = ledger.deployments(&args.horizon, Some(args.limit))?;
        let replayed_active = ledger.replay_active(&args.horizon)?;
        Ok(LedgerList {
            horizon: args.horizon.clone(),
            replayed_active,
            rows,
        })
    }

    fn history_list(&self, args: &HorizonListArgs) -> Result<HistoryList> {
        self.ensure_horizon(&args.horizon)?;
        let rows = self.open_ledger()?.history(&args.horizon, Some(args.limit))?;
        Ok(HistoryList { rows })
    }

    fn register(&self, horizon: &str, now: DateTime<Utc>) -> Result<RegisterResult> {
        self.ensure_horizon(horizon)?;
        let ledger = self.open_ledger()?;
        let newly_registered = ledger.register_horizon(horizon, now)?;
        Ok(RegisterResult {
            horizon: horizon.to_string(),
            newly_registered,
            registered_at: ledger.registered_at(horizon)?,
        })
    }

    async fn rollback(&self, args: &RollbackArgs) -> Result<DeploymentRecord> {
        self.ensure_horizon(&args.horizon)?;
        // A cycle running in another process owns the horizon until it finishes.
        let _cycle = cycle_locks(&self.config)
            .try_acquire(&args.horizon)
            .map_err(PipelineError::from)?;
        let manager = self.deployment_manager()?;
        info!(
            target: "horizonctl",
            horizon = %args.horizon,
            reason = %args.reason,
            "manual rollback requested"
        );
        let record = manager
            .rollback(
                &args.horizon,
                RollbackCause::Manual {
                    reason: args.reason.clone(),
                },
            )
            .await?;
        Ok(record)
    }

    fn collaborators(&self) -> Result<Collaborators> {
        let section = &self.config.collaborators;
        let spec = |value: &Option<CommandSpec>, name: &'static str| {
            value.clone().ok_or(AppError::MissingCollaborator(name))
        };
        Ok(Collaborators {
            evaluator: Arc::new(CommandEvaluator::new(spec(&section.evaluator, "evaluator")?, None)),
            performance: Arc::new(CommandPerformanceMonitor::new(
                spec(&section.performance, "performance")?,
                None,
            )),
            drift: Arc::new(CommandDriftDetector::new(spec(&section.drift, "drift")?, None)),
            health_probe: Arc::new(CommandHealthProbe::new(
                spec(&section.health_probe, "health_probe")?,
                None,
            )),
            notifier: Arc::new(TracingNotifier),
        })
    }

    async fn run_cycles(&self, args: &RunArgs, now: DateTime<Utc>) -> Result<CycleList> {
        if let Some(horizon) = &args.horizon {
            self.ensure_horizon(horizon)?;
        }
        let orchestrator = PipelineOrchestrator::new(self.config.clone(), self.collaborators()?)?;
        let options = CycleOptions { force: args.force };
        let results = match &args.horizon {
            Some(horizon) => vec![orchestrator.run_cycle(horizon, now, options).await],
            None => orchestrator.run_all(now, options).await,
        };

        let mut list = CycleList::default();
        for result in results {
            match result {
                Ok(report) => list.reports.push(report),
                Err(err) => list.errors.push(err.to_string()),
            }
        }
        Ok(list)
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub state_dir: String,
    pub ledger_db: String,
    pub horizons: Vec<HorizonStatus>,
}

#[derive(Debug, Serialize)]
pub struct HorizonStatus {
    pub horizon: String,
    pub active_config_id: Option<String>,
    pub active_created_at: Option<DateTime<Utc>>,
    pub backups: usize,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_optimization_at: Option<DateTime<Utc>>,
    pub last_cycle_status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LedgerList {
    pub horizon: String,
    pub replayed_active: Option<String>,
    pub rows: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize)]
pub struct HistoryList {
    pub rows: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResult {
    pub horizon: String,
    pub newly_registered: bool,
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize)]
pub struct CycleList {
    pub reports: Vec<CycleReport>,
    /// Cycles that could not start, such as a horizon already in flight.
    pub errors: Vec<String>,
}

struct Short<'a>(Option<&'a str>);

impl fmt::Display for Short<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{}", &id[..id.len().min(12)]),
            None => write!(f, "-"),
        }
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("State: {}", self.state_dir),
            format!("Ledger: {}", self.ledger_db),
        ];
        if self.horizons.is_empty() {
            lines.push("No horizons configured".to_string());
        }
        for h in &self.horizons {
            lines.push(format!(
                "{} | active={} | backups={} | registered={} | last_run={} | last_cycle={}",
                h.horizon,
                Short(h.active_config_id.as_deref()),
                h.backups,
                timestamp(h.registered_at),
                timestamp(h.last_optimization_at),
                h.last_cycle_status.as_deref().unwrap_or("-"),
            ));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for LedgerList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return format!("No transitions recorded for {}", self.horizon);
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let record = &entry.record;
            let mut line = format!(
                "#{seq} {at} {outcome} {prev} -> {next}",
                seq = entry.seq,
                at = record.deployed_at.format("%Y-%m-%d %H:%M:%S"),
                outcome = record.outcome,
                prev = Short(record.previous_config_id.as_deref()),
                next = Short(Some(record.deployed_config_id.as_str())),
            );
            if let Some(reason) = &record.rollback_reason {
                line.push_str(&format!(" ({reason})"));
            }
            lines.push(line);
        }
        lines.push(format!(
            "Replayed active: {}",
            Short(self.replayed_active.as_deref())
        ));
        lines.join("\n")
    }
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No history recorded".to_string();
        }
        self.rows
            .iter()
            .map(|entry| {
                format!(
                    "{} {} {}",
                    entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.kind,
                    entry.payload
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for RegisterResult {
    fn display(&self) -> String {
        if self.newly_registered {
            format!("{} registered at {}", self.horizon, timestamp(self.registered_at))
        } else {
            format!(
                "{} already registered at {}",
                self.horizon,
                timestamp(self.registered_at)
            )
        }
    }
}

impl DisplayFallback for DeploymentRecord {
    fn display(&self) -> String {
        format!(
            "{} {}: {} -> {} ({})",
            self.horizon,
            self.outcome,
            Short(self.previous_config_id.as_deref()),
            Short(Some(self.deployed_config_id.as_str())),
            self.rollback_reason.as_deref().unwrap_or("-"),
        )
    }
}

impl DisplayFallback for CycleList {
    fn display(&self) -> String {
        if self.reports.is_empty() && self.errors.is_empty() {
            return "No cycles run".to_string();
        }
        let mut lines: Vec<String> = self
            .reports
            .iter()
            .map(|report| {
                format!(
                    "[{status}] {horizon} cycle={cycle}: {detail}",
                    status = report.status,
                    horizon = report.horizon,
                    cycle = report.cycle_id,
                    detail = report.detail.as_deref().unwrap_or("-"),
                )
            })
            .collect();
        lines.extend(self.errors.iter().map(|err| format!("[error] {err}")));
        lines.join("\n")
    }
}
