use crate::error::{ForecastError, Result};
use crate::models::{ForecastRow, TimeSeriesTable, TARGET_COLUMN};
use crate::trace::PipelineTrace;
use anyhow::anyhow;
use log::info;

/// Lines predictions up with the observed values for the same hours.
///
/// Predictions are rounded up to whole users. Every exogenous value used for
/// the prediction is carried along with its row.
pub fn combine_forecast_with_truth(
    predictions: &[f64],
    exog_pred: &TimeSeriesTable,
    table: &TimeSeriesTable,
) -> Result<Vec<ForecastRow>> {
    let Some(target) = table.column(TARGET_COLUMN) else {
        return Err(ForecastError::missing_column(
            "Cannot compare to 'real_users': column not found.",
        ));
    };
    if predictions.len() != exog_pred.len() {
        return Err(ForecastError::Pipeline(anyhow!(
            "{} predictions for {} forecast hours",
            predictions.len(),
            exog_pred.len()
        )));
    }

    let index = table.index();
    predictions
        .iter()
        .zip(exog_pred.index())
        .enumerate()
        .map(|(row, (prediction, timestamp))| {
            let position = index.binary_search(timestamp).map_err(|_| {
                ForecastError::Internal(format!("No observed row for {}", timestamp))
            })?;
            let real_users = target.data.cell(position).as_f64().ok_or_else(|| {
                ForecastError::Internal(format!("Missing observed users at {}", timestamp))
            })?;
            Ok(ForecastRow {
                timestamp: *timestamp,
                predicted_users: prediction.ceil() as i64,
                real_users,
                exogenous: exog_pred.row_cells(row),
            })
        })
        .collect()
}

/// Mean absolute error; undefined for empty or mismatched inputs.
pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> Option<f64> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return None;
    }
    let total: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum();
    Some(total / actual.len() as f64)
}

/// Scores the rounded predictions against the observed values.
pub fn evaluate_forecast(rows: &[ForecastRow], trace: &PipelineTrace) -> Option<f64> {
    let span = trace.stage("evaluate");
    let actual: Vec<f64> = rows.iter().map(|row| row.real_users).collect();
    let predicted: Vec<f64> = rows.iter().map(|row| row.predicted_users as f64).collect();
    let mae = mean_absolute_error(&actual, &predicted);
    match mae {
        Some(value) => {
            span.set_attribute("mae", value);
            info!("Forecast MAE over {} hours: {:.4}", rows.len(), value);
        }
        None => span.record_error(&"MAE is undefined for this forecast"),
    }
    mae
}
