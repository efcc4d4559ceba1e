use crate::error::{ForecastError, Result};
use crate::models::TimeSeriesTable;
use chrono::{DateTime, Utc};
use log::debug;

/// Last timestamp of the training+validation prefix.
///
/// Everything after it, exactly `forecast_hours` rows, is held out for
/// evaluation. At least one row must remain on the training side besides the
/// cutoff row itself.
pub fn get_validation_cutoff(
    table: &TimeSeriesTable,
    forecast_hours: usize,
) -> Result<DateTime<Utc>> {
    if forecast_hours == 0 {
        return Err(ForecastError::invalid_input(
            "forecast_hours must be greater than 0",
        ));
    }
    let len = table.len();
    if len < forecast_hours + 2 {
        return Err(ForecastError::insufficient_data(format!(
            "Not enough data to hold out {} hours: {} rows available, at least {} required",
            forecast_hours,
            len,
            forecast_hours + 2
        )));
    }
    let cutoff = table.index()[len - forecast_hours - 1];
    debug!("Validation cutoff at {} for {} hours", cutoff, forecast_hours);
    Ok(cutoff)
}
