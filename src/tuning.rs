use crate::error::{ForecastError, Result};
use crate::features::{LagSpec, OrdinalEncoder, RollingFeatures};
use crate::forecaster::RecursiveForecaster;
use crate::models::{TimeSeriesTable, TARGET_COLUMN};
use crate::regressor::{LightgbmParams, RegressorFactory};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use statrs::distribution::{Continuous, Normal};
use statrs::statistics::Statistics;

pub const DEFAULT_N_TRIALS: usize = 20;
pub const DEFAULT_RANDOM_STATE: u64 = 15926;

pub const N_ESTIMATORS: (i64, i64, i64) = (300, 1000, 100);
pub const MAX_DEPTH: (i64, i64) = (3, 10);
pub const MIN_CHILD_SAMPLES: (i64, i64) = (25, 500);
pub const LEARNING_RATE: (f64, f64) = (0.01, 0.5);
pub const FEATURE_FRACTION: (f64, f64) = (0.5, 1.0);
pub const NUM_LEAVES: (i64, i64) = (20, 150);
pub const REG_ALPHA: (f64, f64) = (0.0, 1.0);
pub const REG_LAMBDA: (f64, f64) = (0.0, 1.0);
pub const MAX_BIN: (i64, i64) = (50, 250);
pub const DAILY_WEEKLY_LAGS: [usize; 9] = [1, 2, 3, 23, 24, 25, 167, 168, 169];

const SEARCH_DIMENSIONS: usize = 10;

/// Candidate lag configurations: the last 48 hours, the last 72 hours, or the
/// hours around one day and one week back.
pub fn lags_grid() -> Vec<LagSpec> {
    vec![
        LagSpec::Window(48),
        LagSpec::Window(72),
        LagSpec::Explicit(DAILY_WEEKLY_LAGS.to_vec()),
    ]
}

fn decode_int(u: f64, low: i64, high: i64, step: i64) -> i64 {
    let count = (high - low) / step + 1;
    let idx = ((u * count as f64).floor() as i64).clamp(0, count - 1);
    low + idx * step
}

fn decode_float(u: f64, low: f64, high: f64) -> f64 {
    (low + u.clamp(0.0, 1.0) * (high - low)).clamp(low, high)
}

/// Maps a point of the unit hypercube onto the search space.
pub fn decode_candidate(point: &[f64], random_state: u64) -> (LightgbmParams, LagSpec) {
    let at = |dim: usize| point.get(dim).copied().unwrap_or(0.5);
    let params = LightgbmParams {
        n_estimators: decode_int(at(0), N_ESTIMATORS.0, N_ESTIMATORS.1, N_ESTIMATORS.2) as usize,
        max_depth: decode_int(at(1), MAX_DEPTH.0, MAX_DEPTH.1, 1) as i32,
        min_child_samples: decode_int(at(2), MIN_CHILD_SAMPLES.0, MIN_CHILD_SAMPLES.1, 1)
            as usize,
        learning_rate: decode_float(at(3), LEARNING_RATE.0, LEARNING_RATE.1),
        feature_fraction: decode_float(at(4), FEATURE_FRACTION.0, FEATURE_FRACTION.1),
        num_leaves: decode_int(at(5), NUM_LEAVES.0, NUM_LEAVES.1, 1) as usize,
        reg_alpha: decode_float(at(6), REG_ALPHA.0, REG_ALPHA.1),
        reg_lambda: decode_float(at(7), REG_LAMBDA.0, REG_LAMBDA.1),
        max_bin: decode_int(at(8), MAX_BIN.0, MAX_BIN.1, 1) as usize,
        random_state,
        verbose: -1,
    };
    let grid = lags_grid();
    let lag_idx = ((at(9) * grid.len() as f64).floor() as usize).min(grid.len() - 1);
    (params, grid[lag_idx].clone())
}

#[derive(Debug, Clone)]
struct Observation {
    point: Vec<f64>,
    metric: f64,
}

/// Tree-structured Parzen Estimator over the unit hypercube, minimising.
///
/// The first `n_startup_trials` suggestions are uniform. After that the
/// observations are split at the `gamma` quantile into good and bad sets and
/// the candidate with the highest `l(x) / g(x)` density ratio wins.
pub struct BayesianSearch {
    gamma: f64,
    n_candidates: usize,
    n_startup_trials: usize,
    dimensions: usize,
    rng: StdRng,
    history: Vec<Observation>,
}

impl BayesianSearch {
    pub fn new(dimensions: usize, seed: u64) -> Self {
        Self {
            gamma: 0.25,
            n_candidates: 24,
            n_startup_trials: 10,
            dimensions,
            rng: StdRng::seed_from_u64(seed),
            history: Vec::new(),
        }
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn suggest(&mut self) -> Vec<f64> {
        if self.history.len() < self.n_startup_trials || self.history.len() < 2 {
            return self.sample_uniform();
        }

        let candidates: Vec<Vec<f64>> = (0..self.n_candidates.max(1))
            .map(|_| self.sample_uniform())
            .collect();
        let (good, bad) = self.split_observations();
        let mut best: Option<(f64, Vec<f64>)> = None;
        for candidate in candidates {
            let ratio = density_ratio(&candidate, &good, &bad);
            match &best {
                Some((best_ratio, _)) if ratio <= *best_ratio => {}
                _ => best = Some((ratio, candidate)),
            }
        }
        best.map(|(_, point)| point).unwrap_or_default()
    }

    pub fn observe(&mut self, point: Vec<f64>, metric: f64) {
        self.history.push(Observation { point, metric });
    }

    fn sample_uniform(&mut self) -> Vec<f64> {
        (0..self.dimensions).map(|_| self.rng.gen::<f64>()).collect()
    }

    fn split_observations(&self) -> (Vec<&Observation>, Vec<&Observation>) {
        let mut sorted: Vec<&Observation> = self.history.iter().collect();
        sorted.sort_by(|a, b| a.metric.total_cmp(&b.metric));
        let n_good = ((sorted.len() as f64) * self.gamma).ceil() as usize;
        let n_good = n_good.clamp(1, sorted.len() - 1);
        let bad = sorted.split_off(n_good);
        (sorted, bad)
    }
}

fn density_ratio(candidate: &[f64], good: &[&Observation], bad: &[&Observation]) -> f64 {
    let mut log_ratio = 0.0;
    for (dim, &x) in candidate.iter().enumerate() {
        let good_samples: Vec<f64> = good.iter().filter_map(|o| o.point.get(dim).copied()).collect();
        let bad_samples: Vec<f64> = bad.iter().filter_map(|o| o.point.get(dim).copied()).collect();
        log_ratio += (kde_density(&good_samples, x) + 1e-12).ln()
            - (kde_density(&bad_samples, x) + 1e-12).ln();
    }
    log_ratio
}

// Gaussian KDE with Scott's rule bandwidth.
fn kde_density(samples: &[f64], point: f64) -> f64 {
    if samples.is_empty() {
        return 1.0;
    }
    let n = samples.len() as f64;
    let std = if samples.len() < 2 {
        1.0
    } else {
        samples.iter().population_std_dev().max(0.01)
    };
    let bandwidth = std * n.powf(-0.2);
    samples
        .iter()
        .filter_map(|&mean| Normal::new(mean, bandwidth).ok())
        .map(|kernel| kernel.pdf(point))
        .sum::<f64>()
        / n
}

/// Everything a search needs: the prepared table, where training ends and how
/// to score each configuration.
pub struct SearchRequest<'a> {
    pub table: &'a TimeSeriesTable,
    pub cutoff: DateTime<Utc>,
    pub exog_features: &'a [String],
    pub rolling: &'a RollingFeatures,
    pub encoder: &'a OrdinalEncoder,
    pub n_trials: usize,
    pub random_state: u64,
    pub steps: usize,
    pub initial_train_size: usize,
}

impl<'a> SearchRequest<'a> {
    pub fn new(
        table: &'a TimeSeriesTable,
        cutoff: DateTime<Utc>,
        exog_features: &'a [String],
        rolling: &'a RollingFeatures,
        encoder: &'a OrdinalEncoder,
        steps: usize,
        initial_train_size: usize,
    ) -> Self {
        Self {
            table,
            cutoff,
            exog_features,
            rolling,
            encoder,
            n_trials: DEFAULT_N_TRIALS,
            random_state: DEFAULT_RANDOM_STATE,
            steps,
            initial_train_size,
        }
    }

    pub fn with_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = n_trials;
        self
    }

    pub fn with_random_state(mut self, random_state: u64) -> Self {
        self.random_state = random_state;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialRecord {
    pub params: LightgbmParams,
    pub lags: LagSpec,
    pub metric: f64,
}

/// The winning configuration, ready to build the final forecaster.
#[derive(Debug, Clone, Serialize)]
pub struct BestConfiguration {
    pub params: LightgbmParams,
    pub lags: LagSpec,
    pub metric: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningOutcome {
    /// Every trial, best metric first.
    pub results: Vec<TrialRecord>,
    pub best: BestConfiguration,
}

/// Training slice of the table: the target and the selected exogenous columns
/// for every row up to and including the cutoff.
fn training_slice(
    table: &TimeSeriesTable,
    cutoff: DateTime<Utc>,
    exog_features: &[String],
) -> Result<(Vec<f64>, TimeSeriesTable)> {
    let training = table.rows_through(cutoff);
    let target = training.numeric_values(TARGET_COLUMN).ok_or_else(|| {
        ForecastError::missing_column("The 'users' column is required but not found in the data.")
    })?;
    let exog = training
        .select_columns(exog_features)
        .map_err(|err| ForecastError::missing_column(err.to_string()))?;
    Ok((target, exog))
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Searches the fixed space for the configuration with the lowest backtest
/// MAE on the rows up to the cutoff.
pub fn run_bayesian_search(
    request: &SearchRequest<'_>,
    factory: &dyn RegressorFactory,
) -> Result<TuningOutcome> {
    if request.n_trials == 0 {
        return Err(ForecastError::invalid_input("n_trials must be greater than 0"));
    }
    let (target, exog) = training_slice(request.table, request.cutoff, request.exog_features)?;

    let max_initial = target.len().saturating_sub(request.steps).max(1);
    let initial_train_size = request.initial_train_size.min(max_initial);
    if initial_train_size != request.initial_train_size {
        warn!(
            "initial_train_size {} leaves no backtest folds in {} training rows; using {}",
            request.initial_train_size,
            target.len(),
            initial_train_size
        );
    }
    info!(
        "Running {} trials of Bayesian search on {} rows (initial_train_size={}, steps={})",
        request.n_trials,
        target.len(),
        initial_train_size,
        request.steps
    );

    let mut search = BayesianSearch::new(SEARCH_DIMENSIONS, request.random_state);
    let mut results = Vec::with_capacity(request.n_trials);
    let pb = progress_bar(request.n_trials);
    for trial in 0..request.n_trials {
        let point = search.suggest();
        let (params, lags) = decode_candidate(&point, request.random_state);
        let metric = RecursiveForecaster::new(
            params.clone(),
            lags.clone(),
            request.rolling.clone(),
            request.encoder.clone(),
            factory,
        )
        .and_then(|mut forecaster| {
            forecaster.backtest(&target, &exog, initial_train_size, request.steps)
        })
        .with_context(|| format!("Trial {} failed (lags {})", trial, lags))
        .map_err(ForecastError::Pipeline)?;
        if !metric.is_finite() {
            return Err(ForecastError::Pipeline(anyhow!(
                "Trial {} produced a non-finite metric",
                trial
            )));
        }

        search.observe(point, metric);
        results.push(TrialRecord {
            params,
            lags,
            metric,
        });
        pb.inc(1);
    }
    pb.finish_and_clear();

    results.sort_by(|a, b| a.metric.total_cmp(&b.metric));
    let Some(first) = results.first() else {
        return Err(ForecastError::Pipeline(anyhow!("Search finished without trials")));
    };
    let mut params = first.params.clone();
    params.random_state = request.random_state;
    params.verbose = -1;
    let best = BestConfiguration {
        params,
        lags: first.lags.clone(),
        metric: first.metric,
    };
    info!(
        "Best configuration: lags {}, backtest MAE {:.4}, params {:?}",
        best.lags, best.metric, best.params
    );
    Ok(TuningOutcome { results, best })
}

/// Builds a fresh forecaster from the winning configuration and fits it on
/// every row up to and including the cutoff.
pub fn train_forecaster_with_best_params(
    table: &TimeSeriesTable,
    cutoff: DateTime<Utc>,
    exog_features: &[String],
    rolling: &RollingFeatures,
    encoder: &OrdinalEncoder,
    best: &BestConfiguration,
    factory: &dyn RegressorFactory,
) -> Result<RecursiveForecaster> {
    let (target, exog) = training_slice(table, cutoff, exog_features)?;
    let mut forecaster = RecursiveForecaster::new(
        best.params.clone(),
        best.lags.clone(),
        rolling.clone(),
        encoder.clone(),
        factory,
    )
    .map_err(ForecastError::Pipeline)?;
    forecaster
        .fit(&target, &exog)
        .context("Final model training failed")
        .map_err(ForecastError::Pipeline)?;
    info!(
        "Trained final forecaster on {} rows through {}",
        target.len(),
        cutoff
    );
    Ok(forecaster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;
    use crate::regressor::Regressor;
    use chrono::{Duration, TimeZone};

    /// Predicts the previous hour shrunk towards the training mean by the
    /// trial's feature fraction.
    struct ShrinkRegressor {
        weight: f64,
        mean: f64,
    }

    impl Regressor for ShrinkRegressor {
        fn fit(&mut self, _features: &[Vec<f64>], target: &[f64]) -> anyhow::Result<()> {
            self.mean = target.iter().sum::<f64>() / target.len() as f64;
            Ok(())
        }

        fn predict(&self, features: &[f64]) -> anyhow::Result<f64> {
            Ok(self.weight * features[0] + (1.0 - self.weight) * self.mean)
        }
    }

    struct ShrinkFactory;

    impl RegressorFactory for ShrinkFactory {
        fn build(&self, params: &LightgbmParams) -> anyhow::Result<Box<dyn Regressor>> {
            Ok(Box::new(ShrinkRegressor {
                weight: params.feature_fraction,
                mean: 0.0,
            }))
        }
    }

    fn hourly_table(rows: usize) -> TimeSeriesTable {
        let start = Utc.with_ymd_and_hms(2012, 9, 1, 0, 0, 0).unwrap();
        TimeSeriesTable::new(
            (0..rows).map(|h| start + Duration::hours(h as i64)).collect(),
            vec![
                Column::numeric(
                    "users",
                    (0..rows)
                        .map(|h| Some(100.0 + 40.0 * ((h % 24) as f64 / 4.0).sin()))
                        .collect(),
                ),
                Column::numeric("temp", (0..rows).map(|h| Some((h % 24) as f64)).collect()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn decoded_candidates_stay_inside_the_space() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let point: Vec<f64> = (0..SEARCH_DIMENSIONS).map(|_| rng.gen::<f64>()).collect();
            let (params, lags) = decode_candidate(&point, 2025);
            assert!((300..=1000).contains(&params.n_estimators));
            assert_eq!(params.n_estimators % 100, 0);
            assert!((3..=10).contains(&params.max_depth));
            assert!((25..=500).contains(&params.min_child_samples));
            assert!((0.01..=0.5).contains(&params.learning_rate));
            assert!((0.5..=1.0).contains(&params.feature_fraction));
            assert!((20..=150).contains(&params.num_leaves));
            assert!((0.0..=1.0).contains(&params.reg_alpha));
            assert!((0.0..=1.0).contains(&params.reg_lambda));
            assert!((50..=250).contains(&params.max_bin));
            assert!(lags_grid().contains(&lags));
            assert_eq!(params.random_state, 2025);
            assert_eq!(params.verbose, -1);
        }
    }

    #[test]
    fn corners_of_the_cube_hit_the_bounds() {
        let (low, lags_low) = decode_candidate(&[0.0; SEARCH_DIMENSIONS], 1);
        assert_eq!(low.n_estimators, 300);
        assert_eq!(low.max_bin, 50);
        assert_eq!(lags_low, LagSpec::Window(48));

        let (high, lags_high) = decode_candidate(&[0.999_999; SEARCH_DIMENSIONS], 1);
        assert_eq!(high.n_estimators, 1000);
        assert_eq!(high.max_depth, 10);
        assert_eq!(high.num_leaves, 150);
        assert_eq!(lags_high, LagSpec::Explicit(DAILY_WEEKLY_LAGS.to_vec()));
    }

    #[test]
    fn search_is_deterministic_for_a_seed() {
        let run = |seed| {
            let mut search = BayesianSearch::new(2, seed).with_startup_trials(3);
            let mut points = Vec::new();
            for _ in 0..8 {
                let point = search.suggest();
                let metric = (point[0] - 0.3).powi(2) + (point[1] - 0.7).powi(2);
                search.observe(point.clone(), metric);
                points.push(point);
            }
            points
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }

    #[test]
    fn model_phase_prefers_regions_near_good_observations() {
        let mut search = BayesianSearch::new(1, 3).with_startup_trials(4);
        for (x, metric) in [(0.1, 0.0), (0.15, 0.1), (0.8, 5.0), (0.9, 6.0), (0.85, 5.5)] {
            search.observe(vec![x], metric);
        }
        let suggestions: Vec<f64> = (0..10).map(|_| search.suggest()[0]).collect();
        let near_good = suggestions.iter().filter(|x| **x < 0.5).count();
        assert!(near_good >= 7, "{suggestions:?}");
    }

    #[test]
    fn kde_peaks_at_samples() {
        let samples = [0.2, 0.25, 0.3];
        assert!(kde_density(&samples, 0.25) > kde_density(&samples, 0.9));
        assert_eq!(kde_density(&[], 0.4), 1.0);
    }

    #[test]
    fn search_past_startup_trials_sorts_results_and_injects_seed() {
        let table = hourly_table(400);
        let cutoff = table.index()[400 - 24 - 1];
        let exog_features = vec!["temp".to_string()];
        let rolling = RollingFeatures::mean(24).unwrap();
        let encoder = OrdinalEncoder::new();
        let request = SearchRequest::new(
            &table,
            cutoff,
            &exog_features,
            &rolling,
            &encoder,
            24,
            300,
        )
        .with_trials(14)
        .with_random_state(99);

        let outcome = run_bayesian_search(&request, &ShrinkFactory).unwrap();

        assert_eq!(outcome.results.len(), 14);
        assert!(outcome
            .results
            .windows(2)
            .all(|pair| pair[0].metric <= pair[1].metric));
        assert_eq!(outcome.best.metric, outcome.results[0].metric);
        assert_eq!(outcome.best.lags, outcome.results[0].lags);
        assert_eq!(outcome.best.params.random_state, 99);
        assert_eq!(outcome.best.params.verbose, -1);
        assert!(outcome.results.iter().all(|trial| trial.metric.is_finite()));
    }

    #[test]
    fn oversized_initial_train_size_is_clamped() {
        let table = hourly_table(400);
        let cutoff = table.index()[375];
        let exog_features = vec!["temp".to_string()];
        let rolling = RollingFeatures::mean(24).unwrap();
        let encoder = OrdinalEncoder::new();
        let request = SearchRequest::new(
            &table,
            cutoff,
            &exog_features,
            &rolling,
            &encoder,
            24,
            10_000,
        )
        .with_trials(2);

        let outcome = run_bayesian_search(&request, &ShrinkFactory).unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.best.params.random_state, DEFAULT_RANDOM_STATE);
    }
}
