use crate::config::{
    ForecastSettings, DEFAULT_INITIAL_TRAIN_FRACTION, DEFAULT_N_TRIALS, DEFAULT_RANDOM_STATE,
};
use crate::data_loader::load_data_from_csv;
use crate::error::{ForecastError, Result};
use crate::evaluation::{combine_forecast_with_truth, evaluate_forecast};
use crate::features::{LagSpec, OrdinalEncoder, RollingFeatures};
use crate::models::{CellValue, ForecastRow, TimeSeriesTable, OUTPUT_TIMESTAMP_FORMAT};
use crate::predict::predict_future;
use crate::preprocessing::{extract_target_and_exog, prepare_time_series};
use crate::regressor::{LightgbmParams, RegressorFactory};
use crate::trace::{PipelineTrace, StageSpan};
use crate::tuning::{run_bayesian_search, train_forecaster_with_best_params, SearchRequest};
use crate::validation::get_validation_cutoff;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const SUCCESS_MESSAGE: &str = "Prediction endpoint success";

/// Where the series comes from.
pub enum ForecastInput<'a> {
    Csv { file_name: &'a str, content: &'a [u8] },
    Table(TimeSeriesTable),
}

#[derive(Debug, Clone)]
pub struct ForecastOptions {
    pub forecast_hours: usize,
    pub window_sizes: usize,
    pub n_trials: usize,
    pub random_state: u64,
    pub initial_train_fraction: f64,
}

impl ForecastOptions {
    pub fn new(forecast_hours: usize, window_sizes: usize) -> Self {
        Self {
            forecast_hours,
            window_sizes,
            n_trials: DEFAULT_N_TRIALS,
            random_state: DEFAULT_RANDOM_STATE,
            initial_train_fraction: DEFAULT_INITIAL_TRAIN_FRACTION,
        }
    }

    pub fn from_settings(
        settings: &ForecastSettings,
        forecast_hours: usize,
        window_sizes: usize,
    ) -> Self {
        Self {
            forecast_hours,
            window_sizes,
            n_trials: settings.n_trials,
            random_state: settings.random_state,
            initial_train_fraction: settings.initial_train_fraction,
        }
    }

    /// Request-level checks that must pass before any data is read.
    pub fn validate(&self) -> Result<()> {
        if self.forecast_hours == 0 {
            return Err(ForecastError::invalid_input(
                "forecast_hours must be greater than 0",
            ));
        }
        if self.window_sizes == 0 {
            return Err(ForecastError::invalid_input(
                "window_sizes must be greater than 0",
            ));
        }
        if self.n_trials == 0 {
            return Err(ForecastError::invalid_input("n_trials must be greater than 0"));
        }
        if !(self.initial_train_fraction > 0.0 && self.initial_train_fraction < 1.0) {
            return Err(ForecastError::invalid_input(
                "initial_train_fraction must be strictly between 0 and 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningSummary {
    pub best_params: LightgbmParams,
    pub best_lags: LagSpec,
    pub best_backtest_mae: f64,
    pub n_trials: usize,
}

#[derive(Debug, Clone)]
pub struct ForecastOutcome {
    pub rows: Vec<ForecastRow>,
    pub mae: f64,
    pub cutoff: DateTime<Utc>,
    pub tuning: TuningSummary,
}

impl ForecastOutcome {
    /// `{"message": ..., "prediction": {"<timestamp>": {...}}, "mae": ...}`
    pub fn to_response_json(&self) -> Value {
        let mut prediction = Map::new();
        for row in &self.rows {
            let mut fields = Map::new();
            fields.insert("predicted_users".to_string(), json!(row.predicted_users));
            fields.insert("real_users".to_string(), number_value(row.real_users));
            for (name, value) in &row.exogenous {
                fields.insert(name.clone(), cell_value(value));
            }
            prediction.insert(
                row.timestamp.format(OUTPUT_TIMESTAMP_FORMAT).to_string(),
                Value::Object(fields),
            );
        }
        json!({
            "message": SUCCESS_MESSAGE,
            "prediction": prediction,
            "mae": self.mae,
        })
    }
}

// Whole numbers render as JSON integers.
fn number_value(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn cell_value(value: &CellValue) -> Value {
    match value {
        CellValue::Number(number) => number_value(*number),
        CellValue::Text(text) => Value::String(text.clone()),
        CellValue::Null => Value::Null,
    }
}

fn in_stage<T, F>(trace: &PipelineTrace, name: &str, run: F) -> Result<T>
where
    F: FnOnce(&StageSpan<'_>) -> Result<T>,
{
    let span = trace.stage(name);
    let result = run(&span);
    if let Err(err) = &result {
        span.record_error(err);
        if err.is_client_error() {
            warn!("Stage {} rejected the request: {}", name, err);
        } else {
            error!("Stage {} failed: {}", name, err);
        }
    }
    result
}

/// Runs the full forecast: load, prepare, tune, train, predict and evaluate.
pub fn forecast_with_tuning(
    input: ForecastInput<'_>,
    options: &ForecastOptions,
    factory: &dyn RegressorFactory,
    trace: &PipelineTrace,
) -> Result<ForecastOutcome> {
    options.validate()?;

    let data = in_stage(trace, "load-data", |span| {
        let raw = match input {
            ForecastInput::Csv { file_name, content } => load_data_from_csv(file_name, content)?,
            ForecastInput::Table(table) => table,
        };
        let prepared = prepare_time_series(raw);
        span.set_attribute("rows", prepared.len());
        Ok(prepared)
    })?;

    let (target, _, exog_features) = extract_target_and_exog(&data, trace)?;

    let cutoff = in_stage(trace, "prepare-validation-window", |span| {
        let cutoff = get_validation_cutoff(&data, options.forecast_hours)?;
        span.set_attribute(
            "end_validation",
            cutoff.format(OUTPUT_TIMESTAMP_FORMAT).to_string(),
        );
        Ok(cutoff)
    })?;

    let (rolling, encoder) = in_stage(trace, "init-transformers", |_| {
        Ok((
            RollingFeatures::mean(options.window_sizes)?,
            OrdinalEncoder::new(),
        ))
    })?;

    let outcome = in_stage(trace, "tune-model", |span| {
        let initial_train_size =
            (target.len() as f64 * options.initial_train_fraction).round() as usize;
        let request = SearchRequest::new(
            &data,
            cutoff,
            &exog_features,
            &rolling,
            &encoder,
            options.forecast_hours,
            initial_train_size,
        )
        .with_trials(options.n_trials)
        .with_random_state(options.random_state);
        let outcome = run_bayesian_search(&request, factory)?;
        span.set_attribute("best_score", outcome.best.metric);
        span.set_attribute("best_lags", outcome.best.lags.to_string());
        Ok(outcome)
    })?;

    let model = in_stage(trace, "train-best-model", |_| {
        train_forecaster_with_best_params(
            &data,
            cutoff,
            &exog_features,
            &rolling,
            &encoder,
            &outcome.best,
            factory,
        )
    })?;

    let (predictions, exog_pred) = in_stage(trace, "make-predictions", |span| {
        let result = predict_future(&model, &data, &exog_features, cutoff, options.forecast_hours)?;
        span.set_attribute("steps", result.0.len());
        Ok(result)
    })?;

    let rows = in_stage(trace, "combine-results", |_| {
        combine_forecast_with_truth(&predictions, &exog_pred, &data)
    })?;

    let Some(mae) = evaluate_forecast(&rows, trace) else {
        let err = ForecastError::Pipeline(anyhow!(
            "MAE is undefined for {} forecast rows",
            rows.len()
        ));
        error!("{}", err);
        return Err(err);
    };

    info!(
        "Forecast complete: {} hours after {}, MAE {:.4}",
        rows.len(),
        cutoff,
        mae
    );
    Ok(ForecastOutcome {
        rows,
        mae,
        cutoff,
        tuning: TuningSummary {
            best_params: outcome.best.params.clone(),
            best_lags: outcome.best.lags.clone(),
            best_backtest_mae: outcome.best.metric,
            n_trials: outcome.results.len(),
        },
    })
}
