pub mod space;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::SearchSection;
use crate::configuration::{Configuration, Hyperparameters};
use crate::evaluation::{BacktestMetrics, BacktestWindow, EvaluationError, Evaluator};

pub use space::SearchSpace;

pub type SearchResult<T> = std::result::Result<T, SearchError>;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search space: {0}")]
    InvalidSpace(String),
    #[error("search exhausted for {horizon}: all {attempted} candidates failed")]
    Exhausted { horizon: String, attempted: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub index: usize,
    pub hyperparameters: Hyperparameters,
    pub metrics: BacktestMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFailure {
    pub index: usize,
    pub hyperparameters: Hyperparameters,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchCompletion {
    Exhaustive,
    /// The wall-clock ceiling was hit; only a sampled subset of the
    /// remaining candidates was scored.
    SampledFallback { sampled: usize, skipped: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRun {
    pub horizon: String,
    pub search_space: SearchSpace,
    pub window: BacktestWindow,
    pub started_at: DateTime<Utc>,
    pub evaluated: Vec<CandidateScore>,
    pub failures: Vec<CandidateFailure>,
    pub best: Option<CandidateScore>,
    pub completion: SearchCompletion,
    #[serde(rename = "duration_ms", with = "crate::duration_serde")]
    pub duration: Duration,
}

impl OptimizationRun {
    pub fn attempted(&self) -> usize {
        self.evaluated.len() + self.failures.len()
    }

    /// Winning candidate, or `Exhausted` when every candidate failed.
    pub fn winner(&self) -> SearchResult<&CandidateScore> {
        self.best.as_ref().ok_or_else(|| SearchError::Exhausted {
            horizon: self.horizon.clone(),
            attempted: self.attempted(),
        })
    }

    pub fn best_configuration(&self, created_at: DateTime<Utc>) -> SearchResult<Configuration> {
        let winner = self.winner()?;
        Ok(Configuration::new(
            self.horizon.clone(),
            winner.hyperparameters,
            winner.metrics,
            self.attempted(),
            created_at,
        ))
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            candidates: self.search_space.len(),
            evaluated: self.evaluated.len(),
            failed: self.failures.len(),
            best: self.best.clone(),
            completion: self.completion,
            duration: self.duration,
        }
    }
}

/// Compact view of a run for history entries and reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub candidates: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub best: Option<CandidateScore>,
    pub completion: SearchCompletion,
    #[serde(rename = "duration_ms", with = "crate::duration_serde")]
    pub duration: Duration,
}

pub struct HyperparameterSearcher {
    evaluator: Arc<dyn Evaluator>,
    config: SearchSection,
}

impl std::fmt::Debug for HyperparameterSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperparameterSearcher")
            .field("config", &self.config)
            .finish()
    }
}

impl HyperparameterSearcher {
    pub fn new(evaluator: Arc<dyn Evaluator>, config: SearchSection) -> Self {
        Self { evaluator, config }
    }

    pub fn window_ending(&self, now: DateTime<Utc>) -> BacktestWindow {
        BacktestWindow::trailing_days(now, self.config.backtest_days)
    }

    /// Scores one configuration point under the per-candidate timeout.
    pub async fn evaluate_one(
        &self,
        horizon: &str,
        hyperparameters: &Hyperparameters,
        window: &BacktestWindow,
    ) -> Result<BacktestMetrics, EvaluationError> {
        let limit = self.config.candidate_timeout();
        let metrics = timeout(
            limit,
            self.evaluator.evaluate(horizon, hyperparameters, window),
        )
        .await
        .map_err(|_| EvaluationError::Timeout(limit))??;
        if !metrics.primary_error.is_finite() {
            return Err(EvaluationError::Failed(format!(
                "non-finite primary error {}",
                metrics.primary_error
            )));
        }
        Ok(metrics)
    }

    pub async fn search(
        &self,
        horizon: &str,
        space: &SearchSpace,
        now: DateTime<Utc>,
    ) -> SearchResult<OptimizationRun> {
        space.validate()?;
        let candidates = space.candidates();
        let window = self.window_ending(now);
        let started = Instant::now();
        let deadline = started + self.config.max_duration();

        info!(
            target: "search",
            horizon = %horizon,
            candidates = candidates.len(),
            window_days = window.days(),
            "starting grid search"
        );

        let mut evaluated = Vec::new();
        let mut failures = Vec::new();
        let mut next = 0usize;
        while next < candidates.len() {
            if Instant::now() >= deadline {
                break;
            }
            self.score(horizon, next, &candidates[next], &window, &mut evaluated, &mut failures)
                .await;
            next += 1;
        }

        let completion = if next < candidates.len() {
            let remaining: Vec<usize> = (next..candidates.len()).collect();
            let sampled = sample_remaining(horizon, space, &remaining, self.config.fallback_sample_size);
            warn!(
                target: "search",
                horizon = %horizon,
                completed = next,
                remaining = remaining.len(),
                sampled = sampled.len(),
                ceiling_secs = self.config.max_duration_seconds,
                "search ceiling exceeded; falling back to sampled subset"
            );
            for index in &sampled {
                self.score(horizon, *index, &candidates[*index], &window, &mut evaluated, &mut failures)
                    .await;
            }
            SearchCompletion::SampledFallback {
                sampled: sampled.len(),
                skipped: remaining.len() - sampled.len(),
            }
        } else {
            SearchCompletion::Exhaustive
        };

        let best = evaluated.iter().min_by(|a, b| rank(a, b)).cloned();
        let run = OptimizationRun {
            horizon: horizon.to_string(),
            search_space: space.clone(),
            window,
            started_at: now,
            evaluated,
            failures,
            best,
            completion,
            duration: started.elapsed(),
        };

        match &run.best {
            Some(best) => info!(
                target: "search",
                horizon = %horizon,
                evaluated = run.evaluated.len(),
                failed = run.failures.len(),
                best_index = best.index,
                best_error = best.metrics.primary_error,
                completion = ?run.completion,
                "grid search completed"
            ),
            None => warn!(
                target: "search",
                horizon = %horizon,
                failed = run.failures.len(),
                "grid search produced no viable candidate"
            ),
        }
        Ok(run)
    }

    async fn score(
        &self,
        horizon: &str,
        index: usize,
        hyperparameters: &Hyperparameters,
        window: &BacktestWindow,
        evaluated: &mut Vec<CandidateScore>,
        failures: &mut Vec<CandidateFailure>,
    ) {
        match self.evaluate_one(horizon, hyperparameters, window).await {
            Ok(metrics) => {
                debug!(
                    target: "search",
                    horizon = %horizon,
                    index,
                    params = %hyperparameters,
                    primary_error = metrics.primary_error,
                    latency_ms = metrics.latency_ms,
                    "candidate scored"
                );
                evaluated.push(CandidateScore {
                    index,
                    hyperparameters: *hyperparameters,
                    metrics,
                });
            }
            Err(err) => {
                warn!(
                    target: "search",
                    horizon = %horizon,
                    index,
                    params = %hyperparameters,
                    error = %err,
                    "candidate evaluation failed; excluding"
                );
                failures.push(CandidateFailure {
                    index,
                    hyperparameters: *hyperparameters,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Lowest primary error wins, then lowest latency, then enumeration order.
fn rank(a: &CandidateScore, b: &CandidateScore) -> Ordering {
    a.metrics
        .primary_error
        .total_cmp(&b.metrics.primary_error)
        .then_with(|| a.metrics.latency_ms.total_cmp(&b.metrics.latency_ms))
        .then_with(|| a.index.cmp(&b.index))
}

fn sample_remaining(
    horizon: &str,
    space: &SearchSpace,
    remaining: &[usize],
    sample_size: usize,
) -> Vec<usize> {
    let mut hasher = Sha256::new();
    hasher.update(horizon.as_bytes());
    hasher.update(space.digest());
    let digest = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    let mut rng = ChaCha20Rng::from_seed(seed);

    let mut picked: Vec<usize> = remaining
        .choose_multiple(&mut rng, sample_size.min(remaining.len()))
        .copied()
        .collect();
    picked.sort_unstable();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::EvaluationResult;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn metrics(primary: f64, latency: f64) -> BacktestMetrics {
        BacktestMetrics {
            primary_error: primary,
            secondary_error: primary / 2.0,
            mae: primary / 3.0,
            std_dev: 1.0,
            latency_ms: latency,
            ci95_coverage: 0.95,
            mean_signed_error: 0.1,
            observations: 90,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap()
    }

    fn config() -> SearchSection {
        SearchSection {
            backtest_days: 90,
            max_duration_seconds: 600,
            candidate_timeout_seconds: 30,
            fallback_sample_size: 5,
        }
    }

    /// Error falls as changepoint scale approaches 0.1 and seasonality grows.
    struct BowlEvaluator;

    #[async_trait]
    impl Evaluator for BowlEvaluator {
        async fn evaluate(
            &self,
            _horizon: &str,
            params: &Hyperparameters,
            _window: &BacktestWindow,
        ) -> EvaluationResult<BacktestMetrics> {
            let primary = (params.changepoint_prior_scale - 0.1).abs() * 10.0
                + 1.0 / params.seasonality_prior_scale
                + params.holidays_prior_scale / 100.0;
            Ok(metrics(primary, 50.0))
        }
    }

    struct ConstantEvaluator {
        latencies: Vec<f64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Evaluator for ConstantEvaluator {
        async fn evaluate(
            &self,
            _horizon: &str,
            _params: &Hyperparameters,
            _window: &BacktestWindow,
        ) -> EvaluationResult<BacktestMetrics> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let latency = self.latencies[call % self.latencies.len()];
            Ok(metrics(4.0, latency))
        }
    }

    struct FailingEvaluator {
        fail_all: bool,
    }

    #[async_trait]
    impl Evaluator for FailingEvaluator {
        async fn evaluate(
            &self,
            _horizon: &str,
            params: &Hyperparameters,
            _window: &BacktestWindow,
        ) -> EvaluationResult<BacktestMetrics> {
            if self.fail_all || params.changepoint_prior_scale == 0.1 {
                return Err(EvaluationError::Failed("model did not converge".into()));
            }
            Ok(metrics(params.changepoint_prior_scale, 10.0))
        }
    }

    struct SlowEvaluator {
        delay: Duration,
        hang_on_first: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Evaluator for SlowEvaluator {
        async fn evaluate(
            &self,
            _horizon: &str,
            params: &Hyperparameters,
            _window: &BacktestWindow,
        ) -> EvaluationResult<BacktestMetrics> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.hang_on_first && call == 0 {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.delay).await;
            Ok(metrics(params.seasonality_prior_scale, 20.0))
        }
    }

    #[tokio::test]
    async fn grid_search_picks_lowest_error() {
        let searcher = HyperparameterSearcher::new(Arc::new(BowlEvaluator), config());
        let run = searcher
            .search("daily", &SearchSpace::default(), now())
            .await
            .unwrap();
        assert_eq!(run.completion, SearchCompletion::Exhaustive);
        assert_eq!(run.evaluated.len(), 27);
        let best = run.winner().unwrap();
        assert_eq!(best.hyperparameters.changepoint_prior_scale, 0.1);
        assert_eq!(best.hyperparameters.seasonality_prior_scale, 10.0);
        assert_eq!(best.hyperparameters.holidays_prior_scale, 0.1);
        assert_eq!(run.window.days(), 90);
    }

    #[tokio::test]
    async fn search_is_deterministic() {
        let searcher = HyperparameterSearcher::new(Arc::new(BowlEvaluator), config());
        let first = searcher
            .search("daily", &SearchSpace::default(), now())
            .await
            .unwrap();
        let second = searcher
            .search("daily", &SearchSpace::default(), now())
            .await
            .unwrap();
        let a = first.best_configuration(now()).unwrap();
        let b = second.best_configuration(now()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.hyperparameters, b.hyperparameters);
        assert_eq!(a.search_iterations, 27);
    }

    #[tokio::test]
    async fn ties_break_on_latency_then_order() {
        let evaluator = ConstantEvaluator {
            latencies: vec![30.0, 30.0, 12.0, 12.0, 40.0],
            calls: AtomicUsize::new(0),
        };
        let mut space = SearchSpace::default();
        space.changepoint_prior_scale = vec![0.05];
        space.seasonality_prior_scale = vec![1.0];
        space.holidays_prior_scale = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        let searcher = HyperparameterSearcher::new(Arc::new(evaluator), config());
        let run = searcher.search("weekly", &space, now()).await.unwrap();
        let best = run.winner().unwrap();
        assert_eq!(best.index, 2);
        assert_eq!(best.hyperparameters.holidays_prior_scale, 0.3);
    }

    #[tokio::test]
    async fn failed_candidates_are_excluded() {
        let searcher = HyperparameterSearcher::new(
            Arc::new(FailingEvaluator { fail_all: false }),
            config(),
        );
        let run = searcher
            .search("daily", &SearchSpace::default(), now())
            .await
            .unwrap();
        assert_eq!(run.failures.len(), 9);
        assert_eq!(run.evaluated.len(), 18);
        assert!(run
            .failures
            .iter()
            .all(|f| f.hyperparameters.changepoint_prior_scale == 0.1));
        assert_eq!(run.winner().unwrap().hyperparameters.changepoint_prior_scale, 0.01);
    }

    #[tokio::test]
    async fn all_failures_leave_no_winner() {
        let searcher = HyperparameterSearcher::new(
            Arc::new(FailingEvaluator { fail_all: true }),
            config(),
        );
        let run = searcher
            .search("daily", &SearchSpace::default(), now())
            .await
            .unwrap();
        assert!(run.best.is_none());
        assert_eq!(run.failures.len(), 27);
        match run.best_configuration(now()) {
            Err(SearchError::Exhausted { attempted, .. }) => assert_eq!(attempted, 27),
            other => panic!("expected exhausted search, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_evaluation_counts_as_failure() {
        let evaluator = SlowEvaluator {
            delay: Duration::from_secs(1),
            hang_on_first: true,
            calls: AtomicUsize::new(0),
        };
        let searcher = HyperparameterSearcher::new(Arc::new(evaluator), config());
        let run = searcher
            .search("daily", &SearchSpace::default(), now())
            .await
            .unwrap();
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].index, 0);
        assert!(run.failures[0].reason.contains("timed out"));
        assert_eq!(run.evaluated.len(), 26);
        assert_eq!(run.completion, SearchCompletion::Exhaustive);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_falls_back_to_deterministic_sample() {
        let mut cfg = config();
        cfg.max_duration_seconds = 300;
        cfg.candidate_timeout_seconds = 120;

        let mut sampled_runs = Vec::new();
        for _ in 0..2 {
            let evaluator = SlowEvaluator {
                delay: Duration::from_secs(60),
                hang_on_first: false,
                calls: AtomicUsize::new(0),
            };
            let searcher = HyperparameterSearcher::new(Arc::new(evaluator), cfg.clone());
            let run = searcher
                .search("daily", &SearchSpace::default(), now())
                .await
                .unwrap();
            assert_eq!(
                run.completion,
                SearchCompletion::SampledFallback {
                    sampled: 5,
                    skipped: 17
                }
            );
            assert_eq!(run.evaluated.len(), 10);
            assert!(run.evaluated[..5].iter().map(|c| c.index).eq(0..5));
            assert!(run.evaluated[5..].iter().all(|c| c.index >= 5));
            sampled_runs.push(run);
        }
        let indices = |run: &OptimizationRun| -> Vec<usize> {
            run.evaluated.iter().map(|c| c.index).collect()
        };
        assert_eq!(indices(&sampled_runs[0]), indices(&sampled_runs[1]));
        assert_eq!(
            sampled_runs[0].winner().unwrap().index,
            sampled_runs[1].winner().unwrap().index
        );
    }

    #[tokio::test]
    async fn invalid_space_is_rejected() {
        let searcher = HyperparameterSearcher::new(Arc::new(BowlEvaluator), config());
        let mut space = SearchSpace::default();
        space.seasonality_mode.clear();
        let err = searcher.search("daily", &space, now()).await.unwrap_err();
        assert!(matches!(err, SearchError::InvalidSpace(_)));
    }

    #[test]
    fn sampling_is_seeded_by_horizon_and_space() {
        let space = SearchSpace::default();
        let remaining: Vec<usize> = (5..27).collect();
        let a = sample_remaining("daily", &space, &remaining, 5);
        let b = sample_remaining("daily", &space, &remaining, 5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_remaining("daily", &space, &remaining, 50).len(), 22);
    }
}
