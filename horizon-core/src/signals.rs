use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type SignalResult<T> = std::result::Result<T, SignalError>;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal unavailable: {0}")]
    Unavailable(String),
    #[error("signal timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("signal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode signal: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Recent-vs-baseline forecast error for a horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSignal {
    pub recent_error: f64,
    pub baseline_error: f64,
}

impl PerformanceSignal {
    /// Relative degradation of the recent window, `None` when the baseline
    /// cannot serve as a denominator.
    pub fn degradation(&self) -> Option<f64> {
        if !self.recent_error.is_finite()
            || !self.baseline_error.is_finite()
            || self.baseline_error <= 0.0
        {
            return None;
        }
        Some((self.recent_error - self.baseline_error) / self.baseline_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl DriftSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::None => "none",
            DriftSeverity::Low => "low",
            DriftSeverity::Medium => "medium",
            DriftSeverity::High => "high",
            DriftSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for DriftSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftSignal {
    pub p_value: f64,
    pub severity: DriftSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[async_trait]
pub trait PerformanceMonitor: Send + Sync {
    async fn performance(&self, horizon: &str) -> SignalResult<PerformanceSignal>;
}

#[async_trait]
pub trait DriftDetector: Send + Sync {
    async fn drift(&self, horizon: &str) -> SignalResult<DriftSignal>;
}

/// Liveness check for the service currently serving a horizon.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, horizon: &str) -> SignalResult<HealthStatus>;
}
