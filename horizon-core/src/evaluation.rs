use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::configuration::Hyperparameters;

/// Relative differences closer to a threshold than this count as equal to it.
pub(crate) const RELATIVE_TOLERANCE: f64 = 1e-9;

/// Snaps floating-point noise around zero so inclusive thresholds hold at
/// their exact boundary.
pub(crate) fn settle(margin: f64) -> f64 {
    if margin.abs() < RELATIVE_TOLERANCE {
        0.0
    } else {
        margin
    }
}

pub type EvaluationResult<T> = std::result::Result<T, EvaluationError>;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
    #[error("evaluation failed: {0}")]
    Failed(String),
    #[error("evaluator io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode evaluator output: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Bounded historical slice used for backtesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BacktestWindow {
    pub fn trailing_days(end: DateTime<Utc>, days: u32) -> Self {
        Self {
            start: end - chrono::Duration::days(i64::from(days)),
            end,
        }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

/// Error metrics produced by one backtest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub primary_error: f64,
    pub secondary_error: f64,
    pub mae: f64,
    pub std_dev: f64,
    pub latency_ms: f64,
    pub ci95_coverage: f64,
    pub mean_signed_error: f64,
    #[serde(default)]
    pub observations: u32,
}

/// Backtest engine for a horizon's forecasting model.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        horizon: &str,
        hyperparameters: &Hyperparameters,
        window: &BacktestWindow,
    ) -> EvaluationResult<BacktestMetrics>;
}
