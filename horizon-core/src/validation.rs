//! Multi-criteria gate between a search winner and the active configuration.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ValidationSection;
use crate::configuration::Configuration;
use crate::evaluation::settle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Accuracy,
    Stability,
    Latency,
    Coverage,
    Bias,
}

impl Criterion {
    pub const ALL: [Criterion; 5] = [
        Criterion::Accuracy,
        Criterion::Stability,
        Criterion::Latency,
        Criterion::Coverage,
        Criterion::Bias,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Criterion::Accuracy => "accuracy",
            Criterion::Stability => "stability",
            Criterion::Latency => "latency",
            Criterion::Coverage => "coverage",
            Criterion::Bias => "bias",
        }
    }

    /// Criteria that compare against the active configuration.
    pub fn needs_baseline(&self) -> bool {
        matches!(
            self,
            Criterion::Accuracy | Criterion::Stability | Criterion::Latency
        )
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: Criterion,
    pub value: Option<f64>,
    pub threshold: f64,
    /// Distance from the threshold on the passing side; negative when failing.
    pub margin: Option<f64>,
    pub passed: bool,
    pub detail: String,
}

impl CriterionResult {
    fn measured(criterion: Criterion, value: f64, threshold: f64, margin: f64, detail: String) -> Self {
        let margin = settle(margin);
        Self {
            criterion,
            value: Some(value),
            threshold,
            margin: Some(margin),
            passed: margin >= 0.0,
            detail,
        }
    }

    fn uncomputable(criterion: Criterion, threshold: f64, detail: impl Into<String>) -> Self {
        Self {
            criterion,
            value: None,
            threshold,
            margin: None,
            passed: false,
            detail: detail.into(),
        }
    }

    fn no_baseline(criterion: Criterion, threshold: f64) -> Self {
        Self {
            criterion,
            value: None,
            threshold,
            margin: None,
            passed: true,
            detail: "no baseline".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub horizon: String,
    pub candidate_id: String,
    pub baseline_id: Option<String>,
    pub criteria: Vec<CriterionResult>,
    pub approved: bool,
    pub rejection_reasons: Vec<String>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn criterion(&self, criterion: Criterion) -> Option<&CriterionResult> {
        self.criteria.iter().find(|c| c.criterion == criterion)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigValidator {
    config: ValidationSection,
}

impl ConfigValidator {
    pub fn new(config: ValidationSection) -> Self {
        Self { config }
    }

    pub fn validate(
        &self,
        candidate: &Configuration,
        baseline: Option<&Configuration>,
    ) -> ValidationReport {
        let criteria: Vec<CriterionResult> = Criterion::ALL
            .iter()
            .map(|criterion| self.check(*criterion, candidate, baseline))
            .collect();
        let rejection_reasons: Vec<String> = criteria
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.criterion.as_str().to_string())
            .collect();
        let report = ValidationReport {
            horizon: candidate.horizon.clone(),
            candidate_id: candidate.id.clone(),
            baseline_id: baseline.map(|b| b.id.clone()),
            approved: rejection_reasons.is_empty(),
            criteria,
            rejection_reasons,
            validated_at: Utc::now(),
        };

        if report.approved {
            info!(
                target: "validation",
                horizon = %report.horizon,
                candidate = %candidate.short_id(),
                baseline = report.baseline_id.as_deref().unwrap_or("none"),
                "candidate approved"
            );
        } else {
            warn!(
                target: "validation",
                horizon = %report.horizon,
                candidate = %candidate.short_id(),
                reasons = ?report.rejection_reasons,
                "candidate rejected"
            );
        }
        report
    }

    fn check(
        &self,
        criterion: Criterion,
        candidate: &Configuration,
        baseline: Option<&Configuration>,
    ) -> CriterionResult {
        let cfg = &self.config;
        let threshold = match criterion {
            Criterion::Accuracy => cfg.min_primary_improvement,
            Criterion::Stability => cfg.max_std_increase,
            Criterion::Latency => cfg.max_latency_increase,
            Criterion::Coverage => cfg.min_coverage,
            Criterion::Bias => cfg.max_abs_bias,
        };
        let cand = &candidate.metrics;

        if criterion.needs_baseline() {
            let Some(base) = baseline.map(|b| &b.metrics) else {
                return CriterionResult::no_baseline(criterion, threshold);
            };
            return match criterion {
                Criterion::Accuracy => self.accuracy(
                    (base.primary_error, cand.primary_error),
                    (base.secondary_error, cand.secondary_error),
                ),
                Criterion::Stability => {
                    increase_within(criterion, base.std_dev, cand.std_dev, threshold)
                }
                _ => increase_within(criterion, base.latency_ms, cand.latency_ms, threshold),
            };
        }

        if cand.observations < cfg.min_observations {
            return CriterionResult::uncomputable(
                criterion,
                threshold,
                format!(
                    "{} backtest points, need {}",
                    cand.observations, cfg.min_observations
                ),
            );
        }

        match criterion {
            Criterion::Coverage => {
                let value = cand.ci95_coverage;
                if !value.is_finite() {
                    return CriterionResult::uncomputable(criterion, threshold, "coverage is not finite");
                }
                CriterionResult::measured(
                    criterion,
                    value,
                    threshold,
                    value - threshold,
                    format!("95% interval coverage {value:.3}, need >= {threshold:.3}"),
                )
            }
            _ => {
                let value = cand.mean_signed_error;
                if !value.is_finite() {
                    return CriterionResult::uncomputable(criterion, threshold, "bias is not finite");
                }
                let margin = threshold - value.abs();
                let mut result = CriterionResult::measured(
                    criterion,
                    value,
                    threshold,
                    margin,
                    format!("|mean signed error| {:.3}, need < {threshold:.3}", value.abs()),
                );
                // strict bound
                result.passed = margin > 0.0;
                result
            }
        }
    }

    /// Each pair is `(baseline, candidate)`.
    fn accuracy(&self, primary: (f64, f64), secondary: (f64, f64)) -> CriterionResult {
        let cfg = &self.config;
        let primary = improvement(primary.0, primary.1);
        let secondary = improvement(secondary.0, secondary.1);
        let threshold = cfg.min_primary_improvement;

        if primary.is_none() && secondary.is_none() {
            return CriterionResult::uncomputable(
                Criterion::Accuracy,
                threshold,
                "baseline errors are not usable denominators",
            );
        }

        let primary_margin = primary.map(|p| settle(p - cfg.min_primary_improvement));
        let secondary_margin = secondary.map(|s| settle(s - cfg.min_secondary_improvement));
        let margin = match (primary_margin, secondary_margin) {
            (Some(p), Some(s)) => p.max(s),
            (Some(p), None) => p,
            (None, Some(s)) => s,
            (None, None) => f64::NEG_INFINITY,
        };
        let fmt_pct = |v: Option<f64>| match v {
            Some(v) => format!("{:.2}%", v * 100.0),
            None => "n/a".to_string(),
        };

        CriterionResult {
            criterion: Criterion::Accuracy,
            value: primary.or(secondary),
            threshold,
            margin: Some(margin),
            passed: margin >= 0.0,
            detail: format!(
                "primary improvement {} (need {:.0}%), secondary improvement {} (need {:.0}%)",
                fmt_pct(primary),
                cfg.min_primary_improvement * 100.0,
                fmt_pct(secondary),
                cfg.min_secondary_improvement * 100.0,
            ),
        }
    }
}

/// Relative reduction of `candidate` against `baseline`.
fn improvement(baseline: f64, candidate: f64) -> Option<f64> {
    if !baseline.is_finite() || !candidate.is_finite() || baseline <= 0.0 {
        return None;
    }
    Some((baseline - candidate) / baseline)
}

fn increase_within(criterion: Criterion, baseline: f64, candidate: f64, threshold: f64) -> CriterionResult {
    if !baseline.is_finite() || !candidate.is_finite() || baseline <= 0.0 {
        return CriterionResult::uncomputable(
            criterion,
            threshold,
            format!("cannot compare {candidate} against baseline {baseline}"),
        );
    }
    let increase = (candidate - baseline) / baseline;
    CriterionResult::measured(
        criterion,
        increase,
        threshold,
        threshold - increase,
        format!(
            "{:+.2}% vs baseline, allowed {:.0}%",
            increase * 100.0,
            threshold * 100.0
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{Hyperparameters, SeasonalityMode};
    use crate::evaluation::BacktestMetrics;
    use chrono::TimeZone;

    fn metrics(primary: f64) -> BacktestMetrics {
        BacktestMetrics {
            primary_error: primary,
            secondary_error: primary / 2.0,
            mae: primary / 3.0,
            std_dev: 2.0,
            latency_ms: 100.0,
            ci95_coverage: 0.95,
            mean_signed_error: 1.0,
            observations: 90,
        }
    }

    fn config(metrics: BacktestMetrics, minute: u32) -> Configuration {
        Configuration::new(
            "daily",
            Hyperparameters {
                changepoint_prior_scale: 0.1,
                seasonality_prior_scale: 1.0,
                holidays_prior_scale: 1.0,
                seasonality_mode: SeasonalityMode::Additive,
            },
            metrics,
            27,
            Utc.with_ymd_and_hms(2024, 6, 1, 0, minute, 0).unwrap(),
        )
    }

    fn scenario_candidate(coverage: f64) -> Configuration {
        config(
            BacktestMetrics {
                primary_error: 9.0,
                secondary_error: 4.9,
                mae: 3.0,
                std_dev: 2.1,
                latency_ms: 120.0,
                ci95_coverage: coverage,
                mean_signed_error: 2.0,
                observations: 90,
            },
            1,
        )
    }

    fn validator() -> ConfigValidator {
        ConfigValidator::new(ValidationSection::default())
    }

    #[test]
    fn healthy_improvement_is_approved() {
        let baseline = config(metrics(10.0), 0);
        let report = validator().validate(&scenario_candidate(0.93), Some(&baseline));
        assert!(report.approved, "{:?}", report.criteria);
        assert!(report.rejection_reasons.is_empty());
        assert_eq!(report.criteria.len(), 5);
        let accuracy = report.criterion(Criterion::Accuracy).unwrap();
        assert!((accuracy.value.unwrap() - 0.1).abs() < 1e-9);
        let latency = report.criterion(Criterion::Latency).unwrap();
        assert!((latency.value.unwrap() - 0.2).abs() < 1e-9);
        assert!(latency.margin.unwrap() > 0.0);
    }

    #[test]
    fn low_coverage_is_the_only_rejection() {
        let baseline = config(metrics(10.0), 0);
        let report = validator().validate(&scenario_candidate(0.85), Some(&baseline));
        assert!(!report.approved);
        assert_eq!(report.rejection_reasons, vec!["coverage".to_string()]);
        let coverage = report.criterion(Criterion::Coverage).unwrap();
        assert!(coverage.margin.unwrap() < 0.0);
    }

    #[test]
    fn insufficient_improvement_is_rejected() {
        let baseline = config(metrics(10.0), 0);
        let mut m = metrics(9.6);
        m.secondary_error = 4.9;
        let report = validator().validate(&config(m, 1), Some(&baseline));
        assert!(!report.approved);
        assert_eq!(report.rejection_reasons, vec!["accuracy".to_string()]);
    }

    #[test]
    fn secondary_improvement_alone_satisfies_accuracy() {
        let baseline = config(metrics(10.0), 0);
        let mut m = metrics(9.8);
        m.secondary_error = 4.8;
        let report = validator().validate(&config(m, 1), Some(&baseline));
        assert!(report.criterion(Criterion::Accuracy).unwrap().passed);
    }

    #[test]
    fn improvement_grid_never_approves_small_gains() {
        let baseline = config(metrics(10.0), 0);
        for step in 0..50 {
            let primary_gain = step as f64 * 0.001;
            for s_step in 0..30 {
                let secondary_gain = s_step as f64 * 0.001;
                let mut m = metrics(10.0 * (1.0 - primary_gain));
                m.secondary_error = 5.0 * (1.0 - secondary_gain);
                let report = validator().validate(&config(m, 1), Some(&baseline));
                assert!(!report.approved, "gain {primary_gain}/{secondary_gain}");
            }
        }
    }

    #[test]
    fn null_baseline_depends_on_coverage_and_bias_only() {
        let mut m = metrics(50.0);
        m.latency_ms = 10_000.0;
        m.std_dev = 100.0;
        let report = validator().validate(&config(m, 1), None);
        assert!(report.approved);
        assert!(report.baseline_id.is_none());
        for criterion in [Criterion::Accuracy, Criterion::Stability, Criterion::Latency] {
            let result = report.criterion(criterion).unwrap();
            assert!(result.passed);
            assert_eq!(result.detail, "no baseline");
        }

        m.mean_signed_error = -6.0;
        let report = validator().validate(&config(m, 1), None);
        assert_eq!(report.rejection_reasons, vec!["bias".to_string()]);
    }

    #[test]
    fn uncomputable_criteria_fail_closed() {
        let mut base = metrics(10.0);
        base.std_dev = 0.0;
        base.primary_error = 0.0;
        base.secondary_error = f64::NAN;
        let baseline = config(base, 0);

        let mut m = metrics(9.0);
        m.observations = 10;
        let report = validator().validate(&config(m, 1), Some(&baseline));
        assert!(!report.approved);
        assert_eq!(
            report.rejection_reasons,
            vec!["accuracy", "stability", "coverage", "bias"]
        );
        assert!(report.criterion(Criterion::Coverage).unwrap().value.is_none());
    }

    #[test]
    fn thresholds_hold_at_their_exact_boundaries() {
        let mut base = metrics(10.0);
        base.secondary_error = 5.0;
        base.std_dev = 2.0;
        base.latency_ms = 80.0;
        let baseline = config(base, 0);

        // 5% primary, 10% std-dev, 50% latency, 0.90 coverage.
        let mut m = metrics(9.5);
        m.secondary_error = 5.0;
        m.std_dev = 2.2;
        m.latency_ms = 120.0;
        m.ci95_coverage = 0.90;
        let report = validator().validate(&config(m, 1), Some(&baseline));
        assert!(report.approved, "{:?}", report.criteria);
        for result in &report.criteria {
            assert!(result.margin.map_or(true, |margin| margin >= 0.0), "{result:?}");
        }

        // 3% secondary alone.
        let mut m = metrics(10.0);
        m.secondary_error = 4.85;
        let report = validator().validate(&config(m, 1), Some(&baseline));
        assert!(report.criterion(Criterion::Accuracy).unwrap().passed);

        // Just past each boundary fails.
        let mut m = metrics(9.5);
        m.secondary_error = 5.0;
        m.std_dev = 2.21;
        m.latency_ms = 121.0;
        m.ci95_coverage = 0.899;
        let report = validator().validate(&config(m, 1), Some(&baseline));
        assert_eq!(report.rejection_reasons, vec!["stability", "latency", "coverage"]);
    }

    #[test]
    fn bias_bound_is_strict() {
        let mut m = metrics(9.0);
        m.mean_signed_error = 5.0;
        let report = validator().validate(&config(m, 1), None);
        assert!(!report.criterion(Criterion::Bias).unwrap().passed);
    }
}
