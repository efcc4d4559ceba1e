use crate::error::{ForecastError, Result};
use crate::models::{TimeSeriesTable, TARGET_COLUMN};
use crate::trace::PipelineTrace;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use std::collections::HashMap;

/// Puts a table on a contiguous hourly grid with every gap filled.
///
/// Rows are sorted by timestamp, duplicate timestamps keep their first
/// occurrence, the index is rebuilt as `min + k * 1h` up to `max`, and gaps are
/// filled: `users` with 0, every other column forward then backward.
pub fn prepare_time_series(table: TimeSeriesTable) -> TimeSeriesTable {
    if table.is_empty() {
        return table;
    }

    let index = table.index();
    let mut order: Vec<usize> = (0..table.len()).collect();
    order.sort_by_key(|&row| index[row]);

    let mut kept = Vec::with_capacity(order.len());
    let mut duplicates = 0usize;
    for row in order {
        match kept.last() {
            Some(&previous) if index[previous] == index[row] => duplicates += 1,
            _ => kept.push(row),
        }
    }
    if duplicates > 0 {
        warn!(
            "Dropped {} rows with duplicate timestamps, keeping the first occurrence",
            duplicates
        );
    }
    let deduped = table.take_rows(&kept);

    let (Some(start), Some(end)) = (deduped.first_timestamp(), deduped.last_timestamp()) else {
        return deduped;
    };
    let grid = hourly_grid(start, end);
    let lookup: HashMap<DateTime<Utc>, usize> = deduped
        .index()
        .iter()
        .enumerate()
        .map(|(row, ts)| (*ts, row))
        .collect();
    let positions: Vec<Option<usize>> = grid.iter().map(|ts| lookup.get(ts).copied()).collect();
    let matched = positions.iter().filter(|pos| pos.is_some()).count();
    if matched < deduped.len() {
        warn!(
            "Dropped {} rows whose timestamps are not on the hourly grid",
            deduped.len() - matched
        );
    }
    debug!(
        "Reindexed {} rows onto {} hourly slots ({} gaps)",
        deduped.len(),
        grid.len(),
        grid.len() - matched
    );

    let mut prepared = deduped.reindexed(grid, &positions);
    for column in prepared.columns_mut() {
        column.data.clear_nan();
        if column.name == TARGET_COLUMN {
            column.data.fill_numeric(0.0);
        }
        column.data.forward_fill();
        column.data.back_fill();
    }

    if !has_hourly_spacing(prepared.index()) {
        warn!("Inferred frequency is not hourly; forcing an hourly index");
        let grid = hourly_grid(start, start + Duration::hours(prepared.len() as i64 - 1));
        let positions: Vec<Option<usize>> = (0..prepared.len()).map(Some).collect();
        prepared = prepared.reindexed(grid, &positions);
    }
    prepared
}

fn hourly_grid(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let steps = (end - start).num_hours().max(0);
    (0..=steps).map(|k| start + Duration::hours(k)).collect()
}

fn has_hourly_spacing(index: &[DateTime<Utc>]) -> bool {
    index
        .windows(2)
        .all(|pair| pair[1] - pair[0] == Duration::hours(1))
}

/// Splits the target series from the exogenous columns.
pub fn extract_target_and_exog(
    table: &TimeSeriesTable,
    trace: &PipelineTrace,
) -> Result<(Vec<f64>, TimeSeriesTable, Vec<String>)> {
    let span = trace.stage("extract-features");
    let Some(target) = table.column(TARGET_COLUMN) else {
        let err = ForecastError::missing_column(
            "The 'users' column is required but not found in the data.",
        );
        span.record_error(&err);
        return Err(err);
    };
    if !target.data.is_numeric() {
        let err = ForecastError::invalid_input("The 'users' column must be numeric.");
        span.record_error(&err);
        return Err(err);
    }
    let Some(values) = table.numeric_values(TARGET_COLUMN) else {
        let err = ForecastError::invalid_input(
            "The 'users' column contains gaps; prepare the series first.",
        );
        span.record_error(&err);
        return Err(err);
    };

    let exog = table.without_column(TARGET_COLUMN);
    let names = exog.column_names();
    span.set_attribute("num_features", names.len());
    Ok((values, exog, names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CellValue, Column};
    use chrono::TimeZone;

    fn hour(offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 9, 1, 0, 0, 0).unwrap() + Duration::hours(offset)
    }

    fn gappy_table() -> TimeSeriesTable {
        // Unsorted, with a duplicate at hour 1 and a hole at hours 3-4.
        TimeSeriesTable::new(
            vec![hour(2), hour(0), hour(1), hour(1), hour(5)],
            vec![
                Column::numeric(
                    "users",
                    vec![Some(20.0), Some(5.0), Some(10.0), Some(99.0), Some(50.0)],
                ),
                Column::numeric("temp", vec![Some(22.0), None, Some(21.0), Some(0.0), Some(19.0)]),
                Column::categorical(
                    "weather",
                    vec![
                        Some("rain".into()),
                        Some("clear".into()),
                        None,
                        Some("snow".into()),
                        Some("clear".into()),
                    ],
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn covers_every_hour_without_gaps() {
        let prepared = prepare_time_series(gappy_table());
        assert_eq!(prepared.index(), (0..6).map(hour).collect::<Vec<_>>().as_slice());
        for column in prepared.columns() {
            assert_eq!(column.data.null_count(), 0, "{}", column.name);
        }
        assert_eq!(
            prepared.numeric_values("users"),
            Some(vec![5.0, 10.0, 20.0, 0.0, 0.0, 50.0])
        );
        // Leading gap is back-filled, interior gaps are forward-filled.
        assert_eq!(
            prepared.numeric_values("temp"),
            Some(vec![21.0, 21.0, 22.0, 22.0, 22.0, 19.0])
        );
        let weather = prepared.column("weather").unwrap();
        assert_eq!(weather.data.cell(1), CellValue::Text("clear".into()));
        assert_eq!(weather.data.cell(4), CellValue::Text("rain".into()));
    }

    #[test]
    fn duplicate_timestamps_keep_first_occurrence() {
        let prepared = prepare_time_series(gappy_table());
        assert_eq!(prepared.numeric_values("users").unwrap()[1], 10.0);
    }

    #[test]
    fn nan_values_are_filled_like_gaps() {
        let table = TimeSeriesTable::new(
            vec![hour(0), hour(1), hour(2)],
            vec![
                Column::numeric("users", vec![Some(1.0), Some(f64::NAN), Some(3.0)]),
                Column::numeric("temp", vec![Some(f64::NAN), Some(8.0), Some(f64::NAN)]),
            ],
        )
        .unwrap();
        let prepared = prepare_time_series(table);
        assert_eq!(prepared.numeric_values("users"), Some(vec![1.0, 0.0, 3.0]));
        assert_eq!(prepared.numeric_values("temp"), Some(vec![8.0, 8.0, 8.0]));
    }

    #[test]
    fn preparation_is_idempotent() {
        let once = prepare_time_series(gappy_table());
        let twice = prepare_time_series(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn off_grid_timestamps_are_dropped() {
        let table = TimeSeriesTable::new(
            vec![hour(0), hour(1) + Duration::minutes(30), hour(2)],
            vec![Column::numeric("users", vec![Some(1.0), Some(7.0), Some(3.0)])],
        )
        .unwrap();
        let prepared = prepare_time_series(table);
        assert_eq!(prepared.numeric_values("users"), Some(vec![1.0, 0.0, 3.0]));
    }

    #[test]
    fn empty_table_stays_empty() {
        assert!(prepare_time_series(TimeSeriesTable::default()).is_empty());
    }

    #[test]
    fn target_is_separated_from_exogenous_columns() {
        let trace = PipelineTrace::new();
        let prepared = prepare_time_series(gappy_table());
        let (target, exog, names) = extract_target_and_exog(&prepared, &trace).unwrap();
        assert_eq!(target.len(), prepared.len());
        assert_eq!(names, vec!["temp".to_string(), "weather".to_string()]);
        assert_eq!(names.len(), prepared.columns().len() - 1);
        assert!(!exog.has_column("users"));
        assert_eq!(
            trace.attribute("extract-features", "num_features"),
            Some(serde_json::json!(2))
        );
    }

    #[test]
    fn missing_target_is_reported() {
        let trace = PipelineTrace::new();
        let table = TimeSeriesTable::new(
            vec![hour(0)],
            vec![Column::numeric("temp", vec![Some(1.0)])],
        )
        .unwrap();
        let err = extract_target_and_exog(&table, &trace).unwrap_err();
        assert!(matches!(err, ForecastError::MissingColumn(_)));
        assert_eq!(
            err.to_string(),
            "The 'users' column is required but not found in the data."
        );
    }
}
