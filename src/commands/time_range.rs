use super::write_response;
use crate::context::AppContext;
use crate::database::fetch_min_max_time;
use crate::error::ForecastError;
use crate::models::OUTPUT_TIMESTAMP_FORMAT;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

pub fn render_time_range(range: Option<(DateTime<Utc>, DateTime<Utc>)>) -> Value {
    let format = |ts: DateTime<Utc>| ts.format(OUTPUT_TIMESTAMP_FORMAT).to_string();
    match range {
        Some((min, max)) => json!({ "min_time": format(min), "max_time": format(max) }),
        None => json!({ "min_time": null, "max_time": null }),
    }
}

/// Prints the earliest and latest timestamps of the feature table.
pub async fn run(app: &AppContext) -> Result<()> {
    let range = fetch_min_max_time(app.database_settings())
        .await
        .map_err(ForecastError::Database)?;
    write_response(&render_time_range(range), None)
}
