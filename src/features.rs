use crate::error::{ForecastError, Result};
use crate::models::{ColumnData, TimeSeriesTable};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

pub const UNKNOWN_CATEGORY: f64 = -1.0;

/// Which past target values feed the model.
///
/// `Window(n)` is shorthand for lags `1..=n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LagSpec {
    Window(usize),
    Explicit(Vec<usize>),
}

impl LagSpec {
    pub fn lags(&self) -> Vec<usize> {
        match self {
            LagSpec::Window(n) => (1..=*n).collect(),
            LagSpec::Explicit(lags) => {
                let mut lags = lags.clone();
                lags.sort_unstable();
                lags.dedup();
                lags
            }
        }
    }

    pub fn max_lag(&self) -> usize {
        self.lags().last().copied().unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        let lags = self.lags();
        if lags.is_empty() || lags.contains(&0) {
            return Err(ForecastError::invalid_input(format!(
                "Lags must be positive and non-empty (got {})",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LagSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LagSpec::Window(n) => write!(f, "{}", n),
            LagSpec::Explicit(lags) => {
                let joined = lags
                    .iter()
                    .map(|lag| lag.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "[{}]", joined)
            }
        }
    }
}

/// Trailing-mean features over the target history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollingFeatures {
    window_sizes: Vec<usize>,
}

impl RollingFeatures {
    pub fn new(window_sizes: Vec<usize>) -> Result<Self> {
        if window_sizes.is_empty() || window_sizes.contains(&0) {
            return Err(ForecastError::invalid_input(
                "window_sizes must be greater than 0",
            ));
        }
        Ok(Self { window_sizes })
    }

    pub fn mean(window_size: usize) -> Result<Self> {
        Self::new(vec![window_size])
    }

    pub fn window_sizes(&self) -> &[usize] {
        &self.window_sizes
    }

    pub fn max_window(&self) -> usize {
        self.window_sizes.iter().copied().max().unwrap_or(0)
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.window_sizes
            .iter()
            .map(|window| format!("roll_mean_{}", window))
            .collect()
    }

    /// Means of the last `window` values of `history`, one per window size.
    pub fn compute(&self, history: &[f64]) -> Vec<f64> {
        self.window_sizes
            .iter()
            .map(|&window| {
                let start = history.len().saturating_sub(window);
                let tail = &history[start..];
                if tail.is_empty() {
                    f64::NAN
                } else {
                    tail.iter().sum::<f64>() / tail.len() as f64
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ColumnEncoding {
    Passthrough,
    Ordinal(HashMap<String, usize>),
}

#[derive(Debug, Clone, PartialEq)]
struct EncodedColumn {
    name: String,
    encoding: ColumnEncoding,
}

/// Maps categorical exogenous columns to integer codes.
///
/// Categories are numbered in sorted order as seen during `fit`; unknown and
/// missing values encode to -1. Numeric columns pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrdinalEncoder {
    columns: Option<Vec<EncodedColumn>>,
}

impl OrdinalEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fit(&mut self, exog: &TimeSeriesTable) {
        let columns = exog
            .columns()
            .iter()
            .map(|column| {
                let encoding = match &column.data {
                    ColumnData::Numeric(_) => ColumnEncoding::Passthrough,
                    ColumnData::Categorical(values) => {
                        let mut categories: Vec<&String> = values.iter().flatten().collect();
                        categories.sort();
                        categories.dedup();
                        ColumnEncoding::Ordinal(
                            categories
                                .into_iter()
                                .enumerate()
                                .map(|(code, category)| (category.clone(), code))
                                .collect(),
                        )
                    }
                };
                EncodedColumn {
                    name: column.name.clone(),
                    encoding,
                }
            })
            .collect();
        self.columns = Some(columns);
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.columns
            .as_ref()
            .map(|columns| columns.iter().map(|column| column.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Encodes every row of `exog`; the result is row-major.
    pub fn transform(&self, exog: &TimeSeriesTable) -> Result<Vec<Vec<f64>>> {
        let Some(columns) = &self.columns else {
            return Err(ForecastError::Internal(
                "Ordinal encoder used before fit".to_string(),
            ));
        };

        let mut encoded_columns = Vec::with_capacity(columns.len());
        for encoded in columns {
            let column = exog.column(&encoded.name).ok_or_else(|| {
                ForecastError::missing_column(format!(
                    "Exogenous column '{}' not found in the data.",
                    encoded.name
                ))
            })?;
            let values: Vec<f64> = match (&encoded.encoding, &column.data) {
                (_, ColumnData::Numeric(values)) => values
                    .iter()
                    .map(|value| value.unwrap_or(f64::NAN))
                    .collect(),
                (ColumnEncoding::Ordinal(codes), ColumnData::Categorical(values)) => values
                    .iter()
                    .map(|value| {
                        value
                            .as_ref()
                            .and_then(|category| codes.get(category))
                            .map(|code| *code as f64)
                            .unwrap_or(UNKNOWN_CATEGORY)
                    })
                    .collect(),
                (ColumnEncoding::Passthrough, ColumnData::Categorical(_)) => {
                    return Err(ForecastError::invalid_input(format!(
                        "Exogenous column '{}' was numeric during training but is categorical now",
                        encoded.name
                    )))
                }
            };
            encoded_columns.push(values);
        }

        Ok((0..exog.len())
            .map(|row| encoded_columns.iter().map(|values| values[row]).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;
    use chrono::{Duration, TimeZone, Utc};

    fn exog(weather: Vec<Option<&str>>) -> TimeSeriesTable {
        let start = Utc.with_ymd_and_hms(2012, 9, 1, 0, 0, 0).unwrap();
        let rows = weather.len();
        TimeSeriesTable::new(
            (0..rows).map(|h| start + Duration::hours(h as i64)).collect(),
            vec![
                Column::numeric("temp", (0..rows).map(|v| Some(v as f64)).collect()),
                Column::categorical(
                    "weather",
                    weather.into_iter().map(|w| w.map(str::to_string)).collect(),
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn lag_specs_expand_and_report_max() {
        assert_eq!(LagSpec::Window(3).lags(), vec![1, 2, 3]);
        assert_eq!(LagSpec::Window(48).max_lag(), 48);
        let explicit = LagSpec::Explicit(vec![1, 2, 3, 23, 24, 25, 167, 168, 169]);
        assert_eq!(explicit.max_lag(), 169);
        assert_eq!(explicit.to_string(), "[1, 2, 3, 23, 24, 25, 167, 168, 169]");
        assert!(LagSpec::Window(0).validate().is_err());
        assert!(LagSpec::Explicit(vec![0, 1]).validate().is_err());
    }

    #[test]
    fn rolling_mean_uses_trailing_window() {
        let rolling = RollingFeatures::mean(3).unwrap();
        assert_eq!(rolling.feature_names(), vec!["roll_mean_3".to_string()]);
        assert_eq!(rolling.compute(&[1.0, 2.0, 3.0, 4.0, 5.0]), vec![4.0]);
        assert_eq!(rolling.compute(&[2.0]), vec![2.0]);
        assert!(RollingFeatures::mean(0).is_err());
    }

    #[test]
    fn encoder_orders_categories_and_flags_unknowns() {
        let mut encoder = OrdinalEncoder::new();
        encoder.fit(&exog(vec![Some("rain"), Some("clear"), Some("rain")]));
        assert_eq!(encoder.feature_names(), vec!["temp", "weather"]);

        let rows = encoder
            .transform(&exog(vec![Some("clear"), Some("rain"), Some("snow"), None]))
            .unwrap();
        assert_eq!(rows[0], vec![0.0, 0.0]);
        assert_eq!(rows[1], vec![1.0, 1.0]);
        assert_eq!(rows[2], vec![2.0, UNKNOWN_CATEGORY]);
        assert_eq!(rows[3], vec![3.0, UNKNOWN_CATEGORY]);
    }

    #[test]
    fn encoder_requires_fit_and_known_columns() {
        let encoder = OrdinalEncoder::new();
        assert!(encoder.transform(&exog(vec![Some("rain")])).is_err());

        let mut encoder = OrdinalEncoder::new();
        encoder.fit(&exog(vec![Some("rain")]));
        let without_weather = exog(vec![Some("rain")]).without_column("weather");
        let err = encoder.transform(&without_weather).unwrap_err();
        assert!(matches!(err, ForecastError::MissingColumn(_)));
    }
}
