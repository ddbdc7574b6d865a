use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::evaluation::BacktestMetrics;

/// How seasonal components combine with the trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonalityMode {
    Additive,
    Multiplicative,
}

impl SeasonalityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeasonalityMode::Additive => "additive",
            SeasonalityMode::Multiplicative => "multiplicative",
        }
    }
}

impl fmt::Display for SeasonalityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully specified point of the search space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    pub holidays_prior_scale: f64,
    pub seasonality_mode: SeasonalityMode,
}

impl Hyperparameters {
    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        hasher.update(self.changepoint_prior_scale.to_le_bytes());
        hasher.update(self.seasonality_prior_scale.to_le_bytes());
        hasher.update(self.holidays_prior_scale.to_le_bytes());
        hasher.update(self.seasonality_mode.as_str().as_bytes());
    }
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cps={} sps={} hps={} mode={}",
            self.changepoint_prior_scale,
            self.seasonality_prior_scale,
            self.holidays_prior_scale,
            self.seasonality_mode
        )
    }
}

/// Immutable configuration record for one horizon.
///
/// The identifier is derived from the horizon, the hyperparameters and the
/// creation instant, so two searches that pick the same point at different
/// times still produce distinct records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,
    pub horizon: String,
    pub hyperparameters: Hyperparameters,
    pub metrics: BacktestMetrics,
    pub search_iterations: usize,
    pub created_at: DateTime<Utc>,
}

impl Configuration {
    pub fn new(
        horizon: impl Into<String>,
        hyperparameters: Hyperparameters,
        metrics: BacktestMetrics,
        search_iterations: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        let horizon = horizon.into();
        let id = Self::compute_id(&horizon, &hyperparameters, created_at);
        Self {
            id,
            horizon,
            hyperparameters,
            metrics,
            search_iterations,
            created_at,
        }
    }

    pub fn compute_id(
        horizon: &str,
        hyperparameters: &Hyperparameters,
        created_at: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(horizon.as_bytes());
        hasher.update([0u8]);
        hyperparameters.digest_into(&mut hasher);
        hasher.update([0u8]);
        hasher.update(
            created_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        hex::encode(hasher.finalize())
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Same configuration, re-scored on a different backtest window.
    pub fn with_metrics(&self, metrics: BacktestMetrics) -> Self {
        Self {
            metrics,
            ..self.clone()
        }
    }
}

/// Horizon names double as directory names for slot storage.
pub fn is_valid_horizon_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params() -> Hyperparameters {
        Hyperparameters {
            changepoint_prior_scale: 0.05,
            seasonality_prior_scale: 1.0,
            holidays_prior_scale: 10.0,
            seasonality_mode: SeasonalityMode::Additive,
        }
    }

    #[test]
    fn id_depends_on_content_and_time() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let a = Configuration::new("h7", params(), BacktestMetrics::default(), 27, at);
        let b = Configuration::new("h7", params(), BacktestMetrics::default(), 27, at);
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);

        let later = Configuration::new(
            "h7",
            params(),
            BacktestMetrics::default(),
            27,
            at + chrono::Duration::seconds(1),
        );
        assert_ne!(a.id, later.id);

        let other_horizon = Configuration::new("h30", params(), BacktestMetrics::default(), 27, at);
        assert_ne!(a.id, other_horizon.id);
    }

    #[test]
    fn horizon_names_are_path_safe() {
        assert!(is_valid_horizon_name("daily-7d"));
        assert!(is_valid_horizon_name("h_30.v2"));
        assert!(!is_valid_horizon_name(""));
        assert!(!is_valid_horizon_name("../etc"));
        assert!(!is_valid_horizon_name(".hidden"));
        assert!(!is_valid_horizon_name("a/b"));
    }
}
