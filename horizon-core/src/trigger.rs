use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::TriggerSection;
use crate::evaluation::settle;
use crate::ledger::{LedgerError, SqliteLedger};
use crate::signals::{DriftDetector, DriftSignal, PerformanceMonitor, SignalError};

pub type TriggerResult<T> = std::result::Result<T, TriggerError>;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("horizon {horizon} has no optimization history and was never registered")]
    NoHistory { horizon: String },
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Why a horizon was selected for optimization. Declaration order is the
/// order reasons are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    PerformanceDegradation,
    DriftDetected,
    ScheduledFallback,
    OnDemand,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::PerformanceDegradation => "performance_degradation",
            TriggerReason::DriftDetected => "drift_detected",
            TriggerReason::ScheduledFallback => "scheduled_fallback",
            TriggerReason::OnDemand => "on_demand",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Performance,
    Drift,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSignal {
    pub signal: SignalKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerReport {
    pub horizon: String,
    pub should_optimize: bool,
    pub reasons: Vec<TriggerReason>,
    pub excluded_signals: Vec<ExcludedSignal>,
    pub degradation: Option<f64>,
    pub drift: Option<DriftSignal>,
    pub last_optimization_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
    pub evaluated_at: DateTime<Utc>,
}

impl TriggerReport {
    /// Report for a run requested by an operator on a horizon with no history.
    pub fn on_demand(horizon: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            horizon: horizon.into(),
            should_optimize: true,
            reasons: vec![TriggerReason::OnDemand],
            excluded_signals: Vec::new(),
            degradation: None,
            drift: None,
            last_optimization_at: None,
            elapsed_seconds: None,
            evaluated_at: now,
        }
    }

    pub fn forced(mut self) -> Self {
        if !self.reasons.contains(&TriggerReason::OnDemand) {
            self.reasons.push(TriggerReason::OnDemand);
        }
        self.should_optimize = true;
        self
    }
}

pub struct TriggerManager {
    performance: Arc<dyn PerformanceMonitor>,
    drift: Arc<dyn DriftDetector>,
    ledger: SqliteLedger,
    config: TriggerSection,
}

impl fmt::Debug for TriggerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerManager")
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish()
    }
}

impl TriggerManager {
    pub fn new(
        performance: Arc<dyn PerformanceMonitor>,
        drift: Arc<dyn DriftDetector>,
        ledger: SqliteLedger,
        config: TriggerSection,
    ) -> Self {
        Self {
            performance,
            drift,
            ledger,
            config,
        }
    }

    pub async fn evaluate(&self, horizon: &str, now: DateTime<Utc>) -> TriggerResult<TriggerReport> {
        let last_run = self.ledger.last_optimization_at(horizon)?;
        let anchor = match last_run {
            Some(at) => at,
            None => self
                .ledger
                .registered_at(horizon)?
                .ok_or_else(|| TriggerError::NoHistory {
                    horizon: horizon.to_string(),
                })?,
        };
        let elapsed = (now - anchor).max(chrono::Duration::zero());

        let limit = self.config.signal_timeout();
        let (performance, drift) = tokio::join!(
            timeout(limit, self.performance.performance(horizon)),
            timeout(limit, self.drift.drift(horizon))
        );
        let performance = performance.unwrap_or_else(|_| Err(SignalError::Timeout(limit)));
        let drift = drift.unwrap_or_else(|_| Err(SignalError::Timeout(limit)));

        let mut reasons = Vec::new();
        let mut excluded = Vec::new();

        let degradation = match performance {
            Ok(signal) => match signal.degradation() {
                Some(value) => Some(value),
                None => {
                    warn!(
                        target: "trigger",
                        horizon = %horizon,
                        recent = signal.recent_error,
                        baseline = signal.baseline_error,
                        "performance signal has no usable baseline; excluding"
                    );
                    excluded.push(ExcludedSignal {
                        signal: SignalKind::Performance,
                        reason: format!("unusable baseline error {}", signal.baseline_error),
                    });
                    None
                }
            },
            Err(err) => {
                warn!(
                    target: "trigger",
                    horizon = %horizon,
                    error = %err,
                    "performance signal unavailable; excluding"
                );
                excluded.push(ExcludedSignal {
                    signal: SignalKind::Performance,
                    reason: err.to_string(),
                });
                None
            }
        };
        if degradation.is_some_and(|value| settle(value - self.config.degradation_threshold) >= 0.0) {
            reasons.push(TriggerReason::PerformanceDegradation);
        }

        let drift = match drift {
            Ok(signal) if signal.p_value.is_finite() => Some(signal),
            Ok(signal) => {
                warn!(
                    target: "trigger",
                    horizon = %horizon,
                    p_value = signal.p_value,
                    "drift signal has non-finite p-value; excluding"
                );
                excluded.push(ExcludedSignal {
                    signal: SignalKind::Drift,
                    reason: format!("non-finite p-value {}", signal.p_value),
                });
                None
            }
            Err(err) => {
                warn!(
                    target: "trigger",
                    horizon = %horizon,
                    error = %err,
                    "drift signal unavailable; excluding"
                );
                excluded.push(ExcludedSignal {
                    signal: SignalKind::Drift,
                    reason: err.to_string(),
                });
                None
            }
        };
        if drift.is_some_and(|signal| {
            signal.p_value < self.config.drift_p_value
                && signal.severity >= self.config.drift_min_severity
        }) {
            reasons.push(TriggerReason::DriftDetected);
        }

        if elapsed >= self.config.fallback_interval() {
            reasons.push(TriggerReason::ScheduledFallback);
        }

        let report = TriggerReport {
            horizon: horizon.to_string(),
            should_optimize: !reasons.is_empty(),
            reasons,
            excluded_signals: excluded,
            degradation,
            drift,
            last_optimization_at: last_run,
            elapsed_seconds: Some(elapsed.num_seconds()),
            evaluated_at: now,
        };

        if report.should_optimize {
            let reasons: Vec<&str> = report.reasons.iter().map(TriggerReason::as_str).collect();
            info!(
                target: "trigger",
                horizon = %horizon,
                reasons = ?reasons,
                elapsed_days = elapsed.num_days(),
                "optimization triggered"
            );
        } else {
            debug!(
                target: "trigger",
                horizon = %horizon,
                elapsed_days = elapsed.num_days(),
                "no trigger condition met"
            );
        }
        Ok(report)
    }
}
