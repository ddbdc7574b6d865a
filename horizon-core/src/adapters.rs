//! Collaborators backed by external programs.
//!
//! Evaluator, performance and drift commands print one JSON document on
//! stdout. The health probe reports through its exit status.

use std::fmt;
use std::path::Path;
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::debug;

use crate::config::CommandSpec;
use crate::configuration::Hyperparameters;
use crate::evaluation::{BacktestMetrics, BacktestWindow, EvaluationError, EvaluationResult, Evaluator};
use crate::signals::{
    DriftDetector, DriftSignal, HealthProbe, HealthStatus, PerformanceMonitor, PerformanceSignal,
    SignalError, SignalResult,
};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        command.output().await
    }
}

#[derive(Clone)]
struct CommandRunner {
    spec: CommandSpec,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner")
            .field("spec", &self.spec)
            .finish()
    }
}

impl CommandRunner {
    fn new(spec: CommandSpec, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            spec,
            executor: executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor)),
        }
    }

    async fn run(&self, extra: Vec<String>) -> std::io::Result<Output> {
        let mut args = self.spec.args.clone();
        args.extend(extra);
        debug!(
            target: "adapters",
            program = %self.spec.program,
            args = ?args,
            "running collaborator command"
        );
        self.executor.run(Path::new(&self.spec.program), &args).await
    }
}

fn stderr_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    let status = output
        .status
        .code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());
    if trimmed.is_empty() {
        format!("exit status {status}")
    } else {
        format!("exit status {status}: {trimmed}")
    }
}

fn decode<T: DeserializeOwned>(output: &Output) -> serde_json::Result<T> {
    serde_json::from_slice(&output.stdout)
}

#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    runner: CommandRunner,
}

impl CommandEvaluator {
    pub fn new(spec: CommandSpec, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            runner: CommandRunner::new(spec, executor),
        }
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(
        &self,
        horizon: &str,
        hyperparameters: &Hyperparameters,
        window: &BacktestWindow,
    ) -> EvaluationResult<BacktestMetrics> {
        let args = vec![
            "--horizon".to_string(),
            horizon.to_string(),
            "--window-start".to_string(),
            window.start.to_rfc3339(),
            "--window-end".to_string(),
            window.end.to_rfc3339(),
            "--hyperparameters".to_string(),
            serde_json::to_string(hyperparameters)?,
        ];
        let output = self.runner.run(args).await?;
        if !output.status.success() {
            return Err(EvaluationError::Failed(stderr_summary(&output)));
        }
        Ok(decode(&output)?)
    }
}

#[derive(Debug, Clone)]
pub struct CommandPerformanceMonitor {
    runner: CommandRunner,
}

impl CommandPerformanceMonitor {
    pub fn new(spec: CommandSpec, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            runner: CommandRunner::new(spec, executor),
        }
    }
}

#[async_trait]
impl PerformanceMonitor for CommandPerformanceMonitor {
    async fn performance(&self, horizon: &str) -> SignalResult<PerformanceSignal> {
        let output = self
            .runner
            .run(vec!["--horizon".to_string(), horizon.to_string()])
            .await?;
        if !output.status.success() {
            return Err(SignalError::Unavailable(stderr_summary(&output)));
        }
        Ok(decode(&output)?)
    }
}

#[derive(Debug, Clone)]
pub struct CommandDriftDetector {
    runner: CommandRunner,
}

impl CommandDriftDetector {
    pub fn new(spec: CommandSpec, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            runner: CommandRunner::new(spec, executor),
        }
    }
}

#[async_trait]
impl DriftDetector for CommandDriftDetector {
    async fn drift(&self, horizon: &str) -> SignalResult<DriftSignal> {
        let output = self
            .runner
            .run(vec!["--horizon".to_string(), horizon.to_string()])
            .await?;
        if !output.status.success() {
            return Err(SignalError::Unavailable(stderr_summary(&output)));
        }
        Ok(decode(&output)?)
    }
}

#[derive(Debug, Clone)]
pub struct CommandHealthProbe {
    runner: CommandRunner,
}

impl CommandHealthProbe {
    pub fn new(spec: CommandSpec, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        Self {
            runner: CommandRunner::new(spec, executor),
        }
    }
}

#[async_trait]
impl HealthProbe for CommandHealthProbe {
    async fn probe(&self, horizon: &str) -> SignalResult<HealthStatus> {
        let output = self
            .runner
            .run(vec!["--horizon".to_string(), horizon.to_string()])
            .await?;
        if output.status.success() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::configuration::SeasonalityMode;
    use crate::signals::DriftSeverity;
    use chrono::{TimeZone, Utc};
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    type RecordedCalls = Arc<Mutex<Vec<(PathBuf, Vec<String>)>>>;

    struct CannedExecutor {
        code: i32,
        stdout: &'static str,
        stderr: &'static str,
        calls: RecordedCalls,
    }

    impl CannedExecutor {
        fn build(code: i32, stdout: &'static str, stderr: &'static str) -> (Arc<dyn CommandExecutor>, RecordedCalls) {
            let calls: RecordedCalls = Arc::new(Mutex::new(Vec::new()));
            let executor: Arc<dyn CommandExecutor> = Arc::new(Self {
                code,
                stdout,
                stderr,
                calls: Arc::clone(&calls),
            });
            (executor, calls)
        }
    }

    #[async_trait]
    impl CommandExecutor for CannedExecutor {
        async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            Ok(Output {
                status: ExitStatus::from_raw(self.code << 8),
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: self.stderr.as_bytes().to_vec(),
            })
        }
    }

    fn spec() -> CommandSpec {
        CommandSpec {
            program: "/opt/forecast/bin/tool".into(),
            args: vec!["--profile".into(), "prod".into()],
        }
    }

    #[tokio::test]
    async fn evaluator_passes_window_and_decodes_metrics() {
        let (executor, calls) = CannedExecutor::build(
            0,
            r#"{"primary_error": 8.5, "secondary_error": 3.1, "mae": 2.2, "std_dev": 1.4,
                "latency_ms": 55.0, "ci95_coverage": 0.94, "mean_signed_error": 0.3,
                "observations": 90}"#,
            "",
        );
        let evaluator = CommandEvaluator::new(spec(), Some(executor));
        let window = BacktestWindow::trailing_days(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(), 90);
        let params = Hyperparameters {
            changepoint_prior_scale: 0.1,
            seasonality_prior_scale: 1.0,
            holidays_prior_scale: 10.0,
            seasonality_mode: SeasonalityMode::Additive,
        };
        let metrics = evaluator.evaluate("daily", &params, &window).await.unwrap();
        assert_eq!(metrics.primary_error, 8.5);
        assert_eq!(metrics.observations, 90);

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, PathBuf::from("/opt/forecast/bin/tool"));
        assert_eq!(&calls[0].1[..4], &["--profile", "prod", "--horizon", "daily"]);
        assert!(calls[0].1.contains(&"--hyperparameters".to_string()));
    }

    #[tokio::test]
    async fn evaluator_failure_carries_stderr() {
        let (executor, _) = CannedExecutor::build(2, "", "model diverged\n");
        let evaluator = CommandEvaluator::new(spec(), Some(executor));
        let window = BacktestWindow::trailing_days(Utc::now(), 30);
        let params = Hyperparameters {
            changepoint_prior_scale: 0.5,
            seasonality_prior_scale: 0.1,
            holidays_prior_scale: 0.1,
            seasonality_mode: SeasonalityMode::Multiplicative,
        };
        match evaluator.evaluate("daily", &params, &window).await {
            Err(EvaluationError::Failed(message)) => {
                assert_eq!(message, "exit status 2: model diverged")
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn signals_decode_or_report_unavailable() {
        let (executor, _) = CannedExecutor::build(0, r#"{"p_value": 0.01, "severity": "high"}"#, "");
        let drift = CommandDriftDetector::new(spec(), Some(executor));
        let signal = drift.drift("weekly").await.unwrap();
        assert_eq!(signal.severity, DriftSeverity::High);

        let (executor, _) = CannedExecutor::build(1, "", "store offline");
        let performance = CommandPerformanceMonitor::new(spec(), Some(executor));
        assert!(matches!(
            performance.performance("weekly").await,
            Err(SignalError::Unavailable(_))
        ));

        let (executor, _) = CannedExecutor::build(0, "not json", "");
        let performance = CommandPerformanceMonitor::new(spec(), Some(executor));
        assert!(matches!(
            performance.performance("weekly").await,
            Err(SignalError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn probe_maps_exit_status() {
        let (executor, _) = CannedExecutor::build(0, "", "");
        let probe = CommandHealthProbe::new(spec(), Some(executor));
        assert_eq!(probe.probe("daily").await.unwrap(), HealthStatus::Healthy);

        let (executor, _) = CannedExecutor::build(3, "", "");
        let probe = CommandHealthProbe::new(spec(), Some(executor));
        assert_eq!(probe.probe("daily").await.unwrap(), HealthStatus::Unhealthy);
    }
}
