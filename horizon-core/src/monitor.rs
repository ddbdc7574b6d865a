use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MonitorSection;
use crate::deployment::{DeploymentManager, DeploymentRecord, RollbackCause};
use crate::signals::HealthProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Observing,
    Passed,
    RolledBack,
    RollbackFailed,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Observing => "observing",
            MonitorState::Passed => "passed",
            MonitorState::RolledBack => "rolled_back",
            MonitorState::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Offset from the start of observation.
    #[serde(rename = "offset_ms", with = "crate::duration_serde")]
    pub offset: Duration,
    pub healthy: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorReport {
    pub horizon: String,
    pub state: MonitorState,
    pub probes: Vec<ProbeOutcome>,
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", with = "crate::duration_serde")]
    pub elapsed: Duration,
    pub rollback: Option<DeploymentRecord>,
    pub error: Option<String>,
}

pub struct PostDeploymentMonitor {
    probe: Arc<dyn HealthProbe>,
    deployments: Arc<DeploymentManager>,
    config: MonitorSection,
}

impl fmt::Debug for PostDeploymentMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostDeploymentMonitor")
            .field("config", &self.config)
            .finish()
    }
}

impl PostDeploymentMonitor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        deployments: Arc<DeploymentManager>,
        config: MonitorSection,
    ) -> Self {
        Self {
            probe,
            deployments,
            config,
        }
    }

    pub fn default_window(&self) -> Duration {
        self.config.window()
    }

    /// Probes the horizon every `probe_interval` until `window` elapses or
    /// `failure_threshold` consecutive probes fail, in which case the active
    /// configuration is rolled back.
    pub async fn observe(&self, horizon: &str, window: Duration) -> MonitorReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + window;
        let period = self.config.probe_interval();
        let mut ticker = interval_at(start + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            target: "monitor",
            horizon = %horizon,
            window_secs = window.as_secs(),
            interval_secs = period.as_secs(),
            "observing deployment"
        );

        let mut report = MonitorReport {
            horizon: horizon.to_string(),
            state: MonitorState::Observing,
            probes: Vec::new(),
            consecutive_failures: 0,
            total_failures: 0,
            started_at,
            finished_at: started_at,
            elapsed: Duration::ZERO,
            rollback: None,
            error: None,
        };

        while report.state == MonitorState::Observing {
            let scheduled = ticker.tick().await;
            if scheduled > deadline {
                report.state = MonitorState::Passed;
                break;
            }

            let outcome = self.probe_once(horizon, scheduled - start).await;
            if outcome.healthy {
                report.consecutive_failures = 0;
                debug!(target: "monitor", horizon = %horizon, "probe healthy");
            } else {
                report.consecutive_failures += 1;
                report.total_failures += 1;
                warn!(
                    target: "monitor",
                    horizon = %horizon,
                    consecutive = report.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    detail = outcome.detail.as_deref().unwrap_or(""),
                    "probe failed"
                );
            }
            report.probes.push(outcome);

            if report.consecutive_failures >= self.config.failure_threshold {
                self.roll_back(horizon, &mut report).await;
            }
        }

        report.elapsed = start.elapsed();
        report.finished_at = started_at
            + chrono::Duration::from_std(report.elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        if report.state == MonitorState::Passed {
            info!(
                target: "monitor",
                horizon = %horizon,
                probes = report.probes.len(),
                failures = report.total_failures,
                "observation window passed"
            );
        }
        report
    }

    async fn probe_once(&self, horizon: &str, offset: Duration) -> ProbeOutcome {
        let limit = self.config.probe_timeout();
        let (healthy, detail) = match timeout(limit, self.probe.probe(horizon)).await {
            Ok(Ok(status)) if status.is_healthy() => (true, None),
            Ok(Ok(_)) => (false, Some("unhealthy".to_string())),
            Ok(Err(err)) => (false, Some(err.to_string())),
            Err(_) => (false, Some(format!("probe timed out after {limit:?}"))),
        };
        ProbeOutcome {
            offset,
            healthy,
            detail,
        }
    }

    async fn roll_back(&self, horizon: &str, report: &mut MonitorReport) {
        let cause = RollbackCause::HealthDegraded {
            consecutive_failures: report.consecutive_failures,
        };
        error!(
            target: "monitor",
            horizon = %horizon,
            consecutive = report.consecutive_failures,
            "post-deployment health degraded; rolling back"
        );
        match self.deployments.rollback(horizon, cause).await {
            Ok(record) => {
                report.state = MonitorState::RolledBack;
                report.rollback = Some(record);
            }
            Err(err) => {
                error!(
                    target: "monitor",
                    horizon = %horizon,
                    error = %err,
                    "automatic rollback failed"
                );
                report.state = MonitorState::RollbackFailed;
                report.error = Some(err.to_string());
            }
        }
    }
}
