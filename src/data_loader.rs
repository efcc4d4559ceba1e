use crate::error::{ForecastError, Result};
use crate::models::{Column, TimeSeriesTable, TIME_COLUMN};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{debug, info};
use std::collections::HashSet;

pub const MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

// Cells pandas reads as missing by default.
const MISSING_MARKERS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NaN", "nan", "NULL", "null", "None", "#N/A", "<NA>",
];

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%dT%H:%M%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Candidate text encodings, tried in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

pub const ENCODINGS: [TextEncoding; 2] = [TextEncoding::Utf8, TextEncoding::Latin1];

impl TextEncoding {
    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "latin-1",
        }
    }

    fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            // Every byte maps to the code point of the same value.
            TextEncoding::Latin1 => Some(bytes.iter().map(|&byte| byte as char).collect()),
        }
    }
}

pub fn decode_content(content: &[u8]) -> Result<(String, TextEncoding)> {
    for encoding in ENCODINGS {
        if let Some(text) = encoding.decode(content) {
            return Ok((text, encoding));
        }
        debug!("Content is not valid {}", encoding.label());
    }
    Err(ForecastError::invalid_input(
        "Unable to decode file. Please ensure it's a valid CSV file",
    ))
}

/// Turns raw CSV bytes into a table indexed by the `date_time` column.
pub fn load_data_from_csv(file_name: &str, content: &[u8]) -> Result<TimeSeriesTable> {
    if !file_name.ends_with(".csv") {
        return Err(ForecastError::invalid_input("File must be a CSV"));
    }
    if content.len() > MAX_FILE_SIZE {
        return Err(ForecastError::invalid_input(
            "File too large. Maximum size is 100MB",
        ));
    }

    let (text, encoding) = decode_content(content)?;
    debug!("Decoded {} as {}", file_name, encoding.label());
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let (headers, records) = read_records(text)?;
    let Some(time_idx) = headers.iter().position(|name| name == TIME_COLUMN) else {
        return Err(ForecastError::invalid_input(
            "CSV must contain a 'date_time' column",
        ));
    };

    let mut index = Vec::with_capacity(records.len());
    for (row, record) in records.iter().enumerate() {
        let raw = record[time_idx].as_str();
        let timestamp = parse_timestamp(raw).ok_or_else(|| {
            ForecastError::invalid_input(format!(
                "Error parsing date_time column: unable to parse '{}' at row {}",
                raw,
                row + 1
            ))
        })?;
        index.push(timestamp);
    }

    let columns = headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != time_idx)
        .map(|(idx, name)| infer_column(name, records.iter().map(|record| record[idx].as_str())))
        .collect();

    let table = TimeSeriesTable::new(index, columns)
        .map_err(|err| ForecastError::Internal(format!("Failed to retrieve data: {err}")))?;
    info!(
        "Loaded {} rows and {} columns from {}",
        table.len(),
        table.columns().len(),
        file_name
    );
    Ok(table)
}

fn read_records(text: &str) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| ForecastError::invalid_input(format!("Malformed CSV header: {err}")))?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.iter().all(|name| name.is_empty()) {
        return Err(ForecastError::invalid_input("CSV file is empty"));
    }
    let mut seen = HashSet::new();
    for name in &headers {
        if !seen.insert(name.as_str()) {
            return Err(ForecastError::invalid_input(format!(
                "CSV contains duplicate column '{}'",
                name
            )));
        }
    }

    let mut records = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|err| {
            ForecastError::invalid_input(format!("Malformed CSV record {}: {}", row + 1, err))
        })?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok((headers, records))
}

fn is_missing(cell: &str) -> bool {
    MISSING_MARKERS.contains(&cell)
}

/// A column is numeric when every present cell parses as a number.
fn infer_column<'a, I>(name: &str, cells: I) -> Column
where
    I: Iterator<Item = &'a str> + Clone,
{
    let numeric = cells
        .clone()
        .filter(|cell| !is_missing(cell))
        .all(|cell| cell.parse::<f64>().is_ok());

    if numeric {
        Column::numeric(
            name,
            cells
                .map(|cell| {
                    if is_missing(cell) {
                        None
                    } else {
                        cell.parse::<f64>().ok().filter(|value| !value.is_nan())
                    }
                })
                .collect(),
        )
    } else {
        Column::categorical(
            name,
            cells
                .map(|cell| (!is_missing(cell)).then(|| cell.to_string()))
                .collect(),
        )
    }
}

/// Parses a timestamp in any of the accepted layouts. Values carrying an
/// offset are converted to UTC; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(trimmed, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0).map(|value| value.and_utc());
        }
    }
    None
}
