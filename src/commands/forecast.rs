use super::{report_outcome, run_pipeline, write_response, ForecastArgs};
use crate::context::AppContext;
use crate::error::ForecastError;
use crate::pipeline::ForecastInput;
use anyhow::Result;
use log::info;
use std::fs;
use std::path::Path;

/// Forecasts from a CSV file on disk.
pub async fn run(
    app: &AppContext,
    file: &Path,
    args: &ForecastArgs,
    output: Option<&Path>,
) -> Result<()> {
    let options = args.options(app);
    options.validate()?;

    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let content = fs::read(file).map_err(|err| {
        ForecastError::Internal(format!(
            "Failed to retrieve data: {}: {}",
            file.display(),
            err
        ))
    })?;
    info!(
        "Forecasting {} hours from {} ({} bytes)",
        options.forecast_hours,
        file.display(),
        content.len()
    );

    let outcome = run_pipeline(
        app,
        ForecastInput::Csv {
            file_name: &file_name,
            content: &content,
        },
        &options,
    )?;
    report_outcome(&outcome);
    write_response(&outcome.to_response_json(), output)
}
