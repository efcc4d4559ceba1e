use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

pub const TIME_COLUMN: &str = "date_time";
pub const TARGET_COLUMN: &str = "users";
pub const OUTPUT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Null,
}

impl CellValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(values) => values.len(),
            ColumnData::Categorical(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnData::Numeric(_))
    }

    pub fn cell(&self, row: usize) -> CellValue {
        match self {
            ColumnData::Numeric(values) => values
                .get(row)
                .copied()
                .flatten()
                .map(CellValue::Number)
                .unwrap_or(CellValue::Null),
            ColumnData::Categorical(values) => values
                .get(row)
                .cloned()
                .flatten()
                .map(CellValue::Text)
                .unwrap_or(CellValue::Null),
        }
    }

    pub fn null_count(&self) -> usize {
        match self {
            ColumnData::Numeric(values) => values.iter().filter(|value| value.is_none()).count(),
            ColumnData::Categorical(values) => {
                values.iter().filter(|value| value.is_none()).count()
            }
        }
    }

    /// Builds a column from positional lookups; `None` positions become gaps.
    pub fn gather(&self, positions: &[Option<usize>]) -> Self {
        match self {
            ColumnData::Numeric(values) => ColumnData::Numeric(
                positions
                    .iter()
                    .map(|pos| pos.and_then(|idx| values.get(idx).copied().flatten()))
                    .collect(),
            ),
            ColumnData::Categorical(values) => ColumnData::Categorical(
                positions
                    .iter()
                    .map(|pos| pos.and_then(|idx| values.get(idx).cloned().flatten()))
                    .collect(),
            ),
        }
    }

    pub fn forward_fill(&mut self) {
        match self {
            ColumnData::Numeric(values) => forward_fill_slice(values),
            ColumnData::Categorical(values) => forward_fill_slice(values),
        }
    }

    pub fn back_fill(&mut self) {
        match self {
            ColumnData::Numeric(values) => {
                values.reverse();
                forward_fill_slice(values);
                values.reverse();
            }
            ColumnData::Categorical(values) => {
                values.reverse();
                forward_fill_slice(values);
                values.reverse();
            }
        }
    }

    /// Turns NaN numbers into gaps.
    pub fn clear_nan(&mut self) {
        if let ColumnData::Numeric(values) = self {
            for slot in values.iter_mut() {
                if slot.is_some_and(f64::is_nan) {
                    *slot = None;
                }
            }
        }
    }

    /// Replaces gaps with `value`. Categorical columns are left untouched.
    pub fn fill_numeric(&mut self, value: f64) {
        if let ColumnData::Numeric(values) = self {
            for slot in values.iter_mut() {
                if slot.is_none() {
                    *slot = Some(value);
                }
            }
        }
    }
}

fn forward_fill_slice<T: Clone>(values: &mut [Option<T>]) {
    let mut last: Option<T> = None;
    for slot in values.iter_mut() {
        match slot {
            Some(value) => last = Some(value.clone()),
            None => {
                if let Some(previous) = &last {
                    *slot = Some(previous.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn numeric<S: Into<String>>(name: S, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Numeric(values),
        }
    }

    pub fn categorical<S: Into<String>>(name: S, values: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::Categorical(values),
        }
    }
}

/// Time-indexed table with named, typed columns.
///
/// The index is not required to be sorted or unique until the table has been
/// through `preprocessing::prepare_time_series`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TimeSeriesTable {
    index: Vec<DateTime<Utc>>,
    columns: Vec<Column>,
}

impl TimeSeriesTable {
    pub fn new(index: Vec<DateTime<Utc>>, columns: Vec<Column>) -> AnyResult<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if column.data.len() != index.len() {
                return Err(anyhow!(
                    "column {} has {} rows but the index has {}",
                    column.name,
                    column.data.len(),
                    index.len()
                ));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(anyhow!("duplicate column name {}", column.name));
            }
        }
        Ok(Self { index, columns })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[DateTime<Utc>] {
        &self.index
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.index.first().copied()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.index.last().copied()
    }

    /// Dense numeric view of a column; gaps and categorical columns yield `None`.
    pub fn numeric_values(&self, name: &str) -> Option<Vec<f64>> {
        match &self.column(name)?.data {
            ColumnData::Numeric(values) => values.iter().copied().collect(),
            ColumnData::Categorical(_) => None,
        }
    }

    pub fn row_cells(&self, row: usize) -> Vec<(String, CellValue)> {
        self.columns
            .iter()
            .map(|column| (column.name.clone(), column.data.cell(row)))
            .collect()
    }

    /// Selects rows by position, in the given order.
    pub fn take_rows(&self, rows: &[usize]) -> Self {
        let positions: Vec<Option<usize>> = rows.iter().map(|row| Some(*row)).collect();
        Self {
            index: rows.iter().filter_map(|row| self.index.get(*row).copied()).collect(),
            columns: self
                .columns
                .iter()
                .map(|column| Column {
                    name: column.name.clone(),
                    data: column.data.gather(&positions),
                })
                .collect(),
        }
    }

    /// Rebuilds the table on a new index, looking each timestamp up in `positions`.
    pub fn reindexed(&self, index: Vec<DateTime<Utc>>, positions: &[Option<usize>]) -> Self {
        Self {
            index,
            columns: self
                .columns
                .iter()
                .map(|column| Column {
                    name: column.name.clone(),
                    data: column.data.gather(positions),
                })
                .collect(),
        }
    }

    pub fn select_columns(&self, names: &[String]) -> AnyResult<Self> {
        let columns = names
            .iter()
            .map(|name| {
                self.column(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("column {} not found", name))
            })
            .collect::<AnyResult<Vec<_>>>()?;
        Ok(Self {
            index: self.index.clone(),
            columns,
        })
    }

    pub fn without_column(&self, name: &str) -> Self {
        Self {
            index: self.index.clone(),
            columns: self
                .columns
                .iter()
                .filter(|column| column.name != name)
                .cloned()
                .collect(),
        }
    }

    /// Rows with timestamp `<= cutoff`. Assumes a sorted index.
    pub fn rows_through(&self, cutoff: DateTime<Utc>) -> Self {
        let end = self.index.partition_point(|ts| *ts <= cutoff);
        self.row_range(0, end)
    }

    /// Rows with timestamp `> cutoff`. Assumes a sorted index.
    pub fn rows_after(&self, cutoff: DateTime<Utc>) -> Self {
        let begin = self.index.partition_point(|ts| *ts <= cutoff);
        self.row_range(begin, self.len())
    }

    pub fn head(&self, count: usize) -> Self {
        self.row_range(0, count.min(self.len()))
    }

    pub fn row_range(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.len());
        let start = start.min(end);
        let rows: Vec<usize> = (start..end).collect();
        self.take_rows(&rows)
    }
}

/// One row of the evaluation window.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRow {
    pub timestamp: DateTime<Utc>,
    pub predicted_users: i64,
    pub real_users: f64,
    pub exogenous: Vec<(String, CellValue)>,
}
