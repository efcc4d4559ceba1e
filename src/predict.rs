use crate::error::{ForecastError, Result};
use crate::forecaster::RecursiveForecaster;
use crate::models::TimeSeriesTable;
use chrono::{DateTime, Utc};
use log::{info, warn};

/// Forecasts the hours right after `cutoff` from the exogenous rows stored for
/// them.
///
/// Uses up to `forecast_hours` rows; a shorter tail shrinks the horizon with a
/// warning. Returns the predictions and the exogenous rows they belong to.
pub fn predict_future(
    model: &RecursiveForecaster,
    table: &TimeSeriesTable,
    exog_features: &[String],
    cutoff: DateTime<Utc>,
    forecast_hours: usize,
) -> Result<(Vec<f64>, TimeSeriesTable)> {
    if forecast_hours == 0 {
        return Err(ForecastError::invalid_input(
            "forecast_hours must be greater than 0",
        ));
    }

    let exog_pred = table
        .rows_after(cutoff)
        .select_columns(exog_features)
        .map_err(|err| ForecastError::missing_column(err.to_string()))?
        .head(forecast_hours);
    if exog_pred.is_empty() {
        return Err(ForecastError::insufficient_data(
            "No future exogenous data available for prediction.",
        ));
    }

    let steps = exog_pred.len();
    if steps < forecast_hours {
        warn!(
            "Only {} future rows available after {}; forecasting {} hours instead of {}",
            steps, cutoff, steps, forecast_hours
        );
    }

    let predictions = model
        .predict(steps, &exog_pred)
        .map_err(ForecastError::Pipeline)?;
    if let Some(start) = exog_pred.first_timestamp() {
        info!("Predicted {} hours starting at {}", predictions.len(), start);
    }
    Ok((predictions, exog_pred))
}
