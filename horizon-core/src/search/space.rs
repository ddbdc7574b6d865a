use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::configuration::{Hyperparameters, SeasonalityMode};

use super::{SearchError, SearchResult};

/// Finite grid of hyperparameter levels.
///
/// Candidates are the Cartesian product of the four dimensions, enumerated
/// with the last dimension varying fastest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpace {
    pub changepoint_prior_scale: Vec<f64>,
    pub seasonality_prior_scale: Vec<f64>,
    pub holidays_prior_scale: Vec<f64>,
    pub seasonality_mode: Vec<SeasonalityMode>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            changepoint_prior_scale: vec![0.01, 0.1, 0.5],
            seasonality_prior_scale: vec![0.1, 1.0, 10.0],
            holidays_prior_scale: vec![0.1, 1.0, 10.0],
            seasonality_mode: vec![SeasonalityMode::Additive],
        }
    }
}

impl SearchSpace {
    pub fn len(&self) -> usize {
        self.changepoint_prior_scale.len()
            * self.seasonality_prior_scale.len()
            * self.holidays_prior_scale.len()
            * self.seasonality_mode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn validate(&self) -> SearchResult<()> {
        let scales = [
            ("changepoint_prior_scale", &self.changepoint_prior_scale),
            ("seasonality_prior_scale", &self.seasonality_prior_scale),
            ("holidays_prior_scale", &self.holidays_prior_scale),
        ];
        for (name, levels) in scales {
            if levels.is_empty() {
                return Err(SearchError::InvalidSpace(format!("{name} has no levels")));
            }
            if let Some(bad) = levels.iter().find(|v| !v.is_finite() || **v <= 0.0) {
                return Err(SearchError::InvalidSpace(format!(
                    "{name} level {bad} must be finite and positive"
                )));
            }
            for (idx, value) in levels.iter().enumerate() {
                if levels[..idx].contains(value) {
                    return Err(SearchError::InvalidSpace(format!(
                        "{name} repeats level {value}"
                    )));
                }
            }
        }
        if self.seasonality_mode.is_empty() {
            return Err(SearchError::InvalidSpace(
                "seasonality_mode has no levels".to_string(),
            ));
        }
        for (idx, mode) in self.seasonality_mode.iter().enumerate() {
            if self.seasonality_mode[..idx].contains(mode) {
                return Err(SearchError::InvalidSpace(format!(
                    "seasonality_mode repeats level {mode}"
                )));
            }
        }
        Ok(())
    }

    pub fn candidates(&self) -> Vec<Hyperparameters> {
        let mut out = Vec::with_capacity(self.len());
        for &changepoint_prior_scale in &self.changepoint_prior_scale {
            for &seasonality_prior_scale in &self.seasonality_prior_scale {
                for &holidays_prior_scale in &self.holidays_prior_scale {
                    for &seasonality_mode in &self.seasonality_mode {
                        out.push(Hyperparameters {
                            changepoint_prior_scale,
                            seasonality_prior_scale,
                            holidays_prior_scale,
                            seasonality_mode,
                        });
                    }
                }
            }
        }
        out
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for levels in [
            &self.changepoint_prior_scale,
            &self.seasonality_prior_scale,
            &self.holidays_prior_scale,
        ] {
            hasher.update((levels.len() as u64).to_le_bytes());
            for value in levels {
                hasher.update(value.to_le_bytes());
            }
        }
        hasher.update((self.seasonality_mode.len() as u64).to_le_bytes());
        for mode in &self.seasonality_mode {
            hasher.update(mode.as_str().as_bytes());
        }
        hasher.finalize().into()
    }
}
