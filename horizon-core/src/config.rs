use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::configuration::is_valid_horizon_name;
use crate::error::{ConfigError, Result};
use crate::search::SearchSpace;
use crate::signals::DriftSeverity;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AutopilotConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub trigger: TriggerSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub deployment: DeploymentSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub collaborators: CollaboratorsSection,
    #[serde(default)]
    pub horizons: Vec<HorizonSection>,
}

impl AutopilotConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.state_dir)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.ledger_db)
    }

    pub fn horizon(&self, name: &str) -> Option<&HorizonSection> {
        self.horizons.iter().find(|h| h.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.trigger;
        if !(t.degradation_threshold > 0.0) {
            return invalid("trigger.degradation_threshold must be positive");
        }
        if !(t.drift_p_value > 0.0 && t.drift_p_value < 1.0) {
            return invalid("trigger.drift_p_value must be between 0 and 1");
        }
        if t.fallback_interval_days == 0 {
            return invalid("trigger.fallback_interval_days must be greater than 0");
        }
        if t.signal_timeout_seconds == 0 {
            return invalid("trigger.signal_timeout_seconds must be greater than 0");
        }

        let s = &self.search;
        if s.backtest_days == 0 {
            return invalid("search.backtest_days must be greater than 0");
        }
        if s.max_duration_seconds == 0 || s.candidate_timeout_seconds == 0 {
            return invalid("search durations must be greater than 0");
        }
        if s.fallback_sample_size == 0 {
            return invalid("search.fallback_sample_size must be greater than 0");
        }

        let v = &self.validation;
        for (name, value) in [
            ("min_primary_improvement", v.min_primary_improvement),
            ("min_secondary_improvement", v.min_secondary_improvement),
            ("max_std_increase", v.max_std_increase),
            ("max_latency_increase", v.max_latency_increase),
            ("max_abs_bias", v.max_abs_bias),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(&format!("validation.{name} must be a non-negative number"));
            }
        }
        if !(v.min_coverage > 0.0 && v.min_coverage <= 1.0) {
            return invalid("validation.min_coverage must be in (0, 1]");
        }

        if self.deployment.backup_retention == 0 {
            return invalid("deployment.backup_retention must keep at least one backup");
        }

        let m = &self.monitor;
        if m.window_minutes == 0 || m.probe_interval_seconds == 0 || m.probe_timeout_seconds == 0 {
            return invalid("monitor durations must be greater than 0");
        }
        if m.failure_threshold == 0 {
            return invalid("monitor.failure_threshold must be greater than 0");
        }
        if m.probe_interval() > m.window() {
            return invalid("monitor.probe_interval_seconds must fit inside the window");
        }

        for (idx, horizon) in self.horizons.iter().enumerate() {
            if !is_valid_horizon_name(&horizon.name) {
                return invalid(&format!("horizon name {:?} is not path safe", horizon.name));
            }
            if self.horizons[..idx].iter().any(|h| h.name == horizon.name) {
                return invalid(&format!("horizon {} is declared twice", horizon.name));
            }
            horizon
                .search_space
                .validate()
                .map_err(|err| ConfigError::Invalid(format!("horizon {}: {err}", horizon.name)))?;
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Result<()> {
    Err(ConfigError::Invalid(message.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub state_dir: String,
    pub ledger_db: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            state_dir: "state/slots".to_string(),
            ledger_db: "state/ledger.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSection {
    /// Relative error increase that counts as degradation (0.15 = 15%).
    pub degradation_threshold: f64,
    pub drift_p_value: f64,
    pub drift_min_severity: DriftSeverity,
    pub fallback_interval_days: u32,
    /// Upper bound on each performance/drift fetch; a slower signal is excluded.
    pub signal_timeout_seconds: u64,
}

impl Default for TriggerSection {
    fn default() -> Self {
        Self {
            degradation_threshold: 0.15,
            drift_p_value: 0.05,
            drift_min_severity: DriftSeverity::Medium,
            fallback_interval_days: 14,
            signal_timeout_seconds: 30,
        }
    }
}

impl TriggerSection {
    pub fn fallback_interval(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.fallback_interval_days))
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_secs(self.signal_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub backtest_days: u32,
    pub max_duration_seconds: u64,
    pub candidate_timeout_seconds: u64,
    pub fallback_sample_size: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            backtest_days: 90,
            max_duration_seconds: 600,
            candidate_timeout_seconds: 120,
            fallback_sample_size: 5,
        }
    }
}

impl SearchSection {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_seconds)
    }

    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_secs(self.candidate_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub min_primary_improvement: f64,
    pub min_secondary_improvement: f64,
    pub max_std_increase: f64,
    pub max_latency_increase: f64,
    pub min_coverage: f64,
    pub max_abs_bias: f64,
    pub min_observations: u32,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            min_primary_improvement: 0.05,
            min_secondary_improvement: 0.03,
            max_std_increase: 0.10,
            max_latency_increase: 0.50,
            min_coverage: 0.90,
            max_abs_bias: 5.0,
            min_observations: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSection {
    /// Backups kept per horizon; older snapshots are pruned after each deploy.
    pub backup_retention: usize,
}

impl Default for DeploymentSection {
    fn default() -> Self {
        Self {
            backup_retention: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub window_minutes: u64,
    pub probe_interval_seconds: u64,
    pub failure_threshold: u32,
    pub probe_timeout_seconds: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            probe_interval_seconds: 60,
            failure_threshold: 3,
            probe_timeout_seconds: 10,
        }
    }
}

impl MonitorSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes * 60)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }
}

/// External programs standing in for the collaborator interfaces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorsSection {
    pub evaluator: Option<CommandSpec>,
    pub performance: Option<CommandSpec>,
    pub drift: Option<CommandSpec>,
    pub health_probe: Option<CommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HorizonSection {
    pub name: String,
    #[serde(default)]
    pub search_space: SearchSpace,
}

pub fn load_autopilot_config<P: AsRef<Path>>(path: P) -> Result<AutopilotConfig> {
    let config: AutopilotConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
