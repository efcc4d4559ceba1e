use super::{report_outcome, run_pipeline, write_response, ForecastArgs};
use crate::context::AppContext;
use crate::data_loader::parse_timestamp;
use crate::database::fetch_range;
use crate::error::{ForecastError, Result as ForecastResult};
use crate::pipeline::ForecastInput;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;
use std::path::Path;

fn parse_bound(label: &str, raw: Option<&str>) -> ForecastResult<Option<DateTime<Utc>>> {
    raw.map(|value| {
        parse_timestamp(value).ok_or_else(|| {
            ForecastError::invalid_input(format!("Invalid {} timestamp: '{}'", label, value))
        })
    })
    .transpose()
}

/// Parses and orders the optional range bounds before any connection is made.
pub fn parse_range(
    start: Option<&str>,
    stop: Option<&str>,
) -> ForecastResult<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let start = parse_bound("start", start)?;
    let stop = parse_bound("stop", stop)?;
    if let (Some(start), Some(stop)) = (start, stop) {
        if start > stop {
            return Err(ForecastError::invalid_input(format!(
                "start {} is after stop {}",
                start, stop
            )));
        }
    }
    Ok((start, stop))
}

/// Forecasts from a time range of the feature table.
pub async fn run(
    app: &AppContext,
    start: Option<&str>,
    stop: Option<&str>,
    args: &ForecastArgs,
    output: Option<&Path>,
) -> Result<()> {
    let options = args.options(app);
    options.validate()?;
    let (start, stop) = parse_range(start, stop)?;

    let table = fetch_range(app.database_settings(), start, stop)
        .await
        .map_err(ForecastError::Database)?;
    if table.is_empty() {
        return Err(ForecastError::insufficient_data("No rows found in the requested range").into());
    }
    info!(
        "Forecasting {} hours from {} database rows",
        options.forecast_hours,
        table.len()
    );

    let outcome = run_pipeline(app, ForecastInput::Table(table), &options)?;
    report_outcome(&outcome);
    write_response(&outcome.to_response_json(), output)
}
