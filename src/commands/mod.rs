pub mod forecast;
pub mod forecast_db;
pub mod time_range;

use crate::context::AppContext;
use crate::error::Result as ForecastResult;
use crate::pipeline::{forecast_with_tuning, ForecastInput, ForecastOptions, ForecastOutcome};
use crate::trace::PipelineTrace;
use anyhow::{Context, Result};
use clap::Args;
use log::{info, warn};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Forecast and search options shared by the forecasting commands.
#[derive(Args, Clone, Debug)]
pub struct ForecastArgs {
    /// Number of hours to hold out and forecast
    #[arg(long = "forecast-hours", default_value_t = crate::config::DEFAULT_FORECAST_HOURS)]
    pub forecast_hours: usize,
    /// Trailing window for the rolling-mean feature
    #[arg(long = "window-sizes", default_value_t = crate::config::DEFAULT_WINDOW_SIZES)]
    pub window_sizes: usize,
    /// Bayesian search trials (defaults to FORECAST_N_TRIALS)
    #[arg(long)]
    pub trials: Option<usize>,
    /// Random seed for the search and the regressor (defaults to FORECAST_RANDOM_STATE)
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ForecastArgs {
    pub fn options(&self, app: &AppContext) -> ForecastOptions {
        let mut options =
            ForecastOptions::from_settings(app.settings(), self.forecast_hours, self.window_sizes);
        if let Some(trials) = self.trials {
            options.n_trials = trials;
        }
        if let Some(seed) = self.seed {
            options.random_state = seed;
        }
        options
    }
}

/// Runs the pipeline with the LightGBM trainer and logs the stage summary,
/// whether or not the run succeeded.
pub(crate) fn run_pipeline(
    app: &AppContext,
    input: ForecastInput<'_>,
    options: &ForecastOptions,
) -> ForecastResult<ForecastOutcome> {
    let factory = app.regressor_factory();
    let trace = PipelineTrace::new();
    let result = forecast_with_tuning(input, options, &factory, &trace);
    trace.log_summary();
    result
}

pub(crate) fn report_outcome(outcome: &ForecastOutcome) {
    let summary = &outcome.tuning;
    info!(
        "Tuning summary: {} trials, best lags {}, best backtest MAE {:.4}",
        summary.n_trials, summary.best_lags, summary.best_backtest_mae
    );
    match serde_json::to_string(summary) {
        Ok(payload) => info!("FORECAST_TUNING_SUMMARY={payload}"),
        Err(err) => warn!("Failed to serialize tuning summary: {err}"),
    }
}

/// Prints `value` as JSON, or writes it to `output` when given.
pub fn write_response(value: &Value, output: Option<&Path>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write response to {}", path.display()))?;
            info!("Response written to {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}
