use crate::features::{LagSpec, OrdinalEncoder, RollingFeatures};
use crate::models::TimeSeriesTable;
use crate::regressor::{LightgbmParams, Regressor, RegressorFactory};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use rayon::prelude::*;

/// Multi-step forecaster that feeds each prediction back in as a lag.
///
/// Features for step `t` are the lagged target values, trailing means over the
/// target history and the encoded exogenous row at `t`.
pub struct RecursiveForecaster {
    lags: LagSpec,
    rolling: RollingFeatures,
    encoder: OrdinalEncoder,
    regressor: Box<dyn Regressor>,
    last_window: Option<Vec<f64>>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl RecursiveForecaster {
    pub fn new(
        params: LightgbmParams,
        lags: LagSpec,
        rolling: RollingFeatures,
        encoder: OrdinalEncoder,
        factory: &dyn RegressorFactory,
    ) -> Result<Self> {
        lags.validate()?;
        let regressor = factory.build(&params)?;
        Ok(Self {
            lags,
            rolling,
            encoder,
            regressor,
            last_window: None,
            last_timestamp: None,
        })
    }

    pub fn is_fitted(&self) -> bool {
        self.last_window.is_some()
    }

    /// Number of past observations needed to build one feature row.
    pub fn window_size(&self) -> usize {
        self.lags.max_lag().max(self.rolling.max_window())
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lags
            .lags()
            .iter()
            .map(|lag| format!("lag_{}", lag))
            .collect();
        names.extend(self.rolling.feature_names());
        names.extend(self.encoder.feature_names());
        names
    }

    /// Fits on the target series and the exogenous table aligned with it.
    pub fn fit(&mut self, target: &[f64], exog: &TimeSeriesTable) -> Result<()> {
        if target.len() != exog.len() {
            return Err(anyhow!(
                "Target has {} rows but exogenous data has {}",
                target.len(),
                exog.len()
            ));
        }
        let window = self.window_size();
        if target.len() <= window {
            return Err(anyhow!(
                "Training series has {} rows; at least {} are needed for a window of {}",
                target.len(),
                window + 1,
                window
            ));
        }

        let mut encoder = self.encoder.clone();
        encoder.fit(exog);
        let encoded = encoder.transform(exog)?;

        let lags = self.lags.lags();
        let rows: Vec<Vec<f64>> = (window..target.len())
            .into_par_iter()
            .map(|t| build_row(&lags, &self.rolling, &target[..t], &encoded[t]))
            .collect();
        let labels = &target[window..];
        debug!(
            "Fitting recursive forecaster on {} rows x {} features (lags {})",
            rows.len(),
            self.feature_names().len(),
            self.lags
        );

        self.regressor
            .fit(&rows, labels)
            .context("Regressor training failed")?;
        self.encoder = encoder;
        self.last_window = Some(target[target.len() - window..].to_vec());
        self.last_timestamp = exog.last_timestamp();
        Ok(())
    }

    /// Predicts `steps` hours past the end of the training data.
    ///
    /// `exog` must start one hour after the last training timestamp and cover
    /// at least `steps` rows.
    pub fn predict(&self, steps: usize, exog: &TimeSeriesTable) -> Result<Vec<f64>> {
        let last_window = self
            .last_window
            .as_ref()
            .ok_or_else(|| anyhow!("Forecaster used before fit"))?;
        if exog.len() < steps {
            return Err(anyhow!(
                "Exogenous data has {} rows; {} steps were requested",
                exog.len(),
                steps
            ));
        }
        if let (Some(last), Some(first)) = (self.last_timestamp, exog.first_timestamp()) {
            let expected = last + Duration::hours(1);
            if first != expected {
                return Err(anyhow!(
                    "Exogenous data must start at {}, found {}",
                    expected,
                    first
                ));
            }
        }
        let encoded = self.encoder.transform(&exog.head(steps))?;
        self.predict_recursive(last_window, &encoded)
    }

    fn predict_recursive(&self, history: &[f64], exog_rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        let lags = self.lags.lags();
        let mut history = history.to_vec();
        let mut predictions = Vec::with_capacity(exog_rows.len());
        for exog_row in exog_rows {
            let row = build_row(&lags, &self.rolling, &history, exog_row);
            let prediction = self.regressor.predict(&row)?;
            history.push(prediction);
            predictions.push(prediction);
        }
        Ok(predictions)
    }

    /// Scores this configuration without refitting between folds.
    ///
    /// The model is fit once on the first `initial_train_size` rows; the rest
    /// is cut into consecutive folds of `steps` rows, each predicted
    /// recursively from the observed values before it. Returns the mean
    /// absolute error over every fold prediction.
    pub fn backtest(
        &mut self,
        target: &[f64],
        exog: &TimeSeriesTable,
        initial_train_size: usize,
        steps: usize,
    ) -> Result<f64> {
        if steps == 0 {
            return Err(anyhow!("Backtest fold size must be greater than 0"));
        }
        if initial_train_size >= target.len() {
            return Err(anyhow!(
                "initial_train_size {} leaves no rows to backtest out of {}",
                initial_train_size,
                target.len()
            ));
        }

        self.fit(&target[..initial_train_size], &exog.head(initial_train_size))?;
        let encoded = self.encoder.transform(exog)?;
        let window = self.window_size();

        let folds: Vec<(usize, usize)> = (initial_train_size..target.len())
            .step_by(steps)
            .map(|start| (start, (start + steps).min(target.len())))
            .collect();
        let fold_errors = folds
            .par_iter()
            .map(|&(start, end)| {
                let history = &target[start - window..start];
                let predictions = self.predict_recursive(history, &encoded[start..end])?;
                Ok(predictions
                    .iter()
                    .zip(&target[start..end])
                    .map(|(predicted, actual)| (predicted - actual).abs())
                    .collect::<Vec<f64>>())
            })
            .collect::<Result<Vec<_>>>()?;

        let errors: Vec<f64> = fold_errors.into_iter().flatten().collect();
        if errors.is_empty() {
            return Err(anyhow!("Backtest produced no predictions"));
        }
        Ok(errors.iter().sum::<f64>() / errors.len() as f64)
    }
}

fn build_row(
    lags: &[usize],
    rolling: &RollingFeatures,
    history: &[f64],
    exog_row: &[f64],
) -> Vec<f64> {
    let mut row = Vec::with_capacity(lags.len() + rolling.window_sizes().len() + exog_row.len());
    row.extend(lags.iter().map(|&lag| history[history.len() - lag]));
    row.extend(rolling.compute(history));
    row.extend_from_slice(exog_row);
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;
    use chrono::TimeZone;

    /// Predicts the first feature, i.e. the most recent lag.
    struct PersistenceRegressor;

    impl Regressor for PersistenceRegressor {
        fn fit(&mut self, features: &[Vec<f64>], _target: &[f64]) -> Result<()> {
            if features.is_empty() {
                return Err(anyhow!("empty"));
            }
            Ok(())
        }

        fn predict(&self, features: &[f64]) -> Result<f64> {
            Ok(features[0])
        }
    }

    struct PersistenceFactory;

    impl RegressorFactory for PersistenceFactory {
        fn build(&self, _params: &LightgbmParams) -> anyhow::Result<Box<dyn Regressor>> {
            Ok(Box::new(PersistenceRegressor))
        }
    }

    fn exog(rows: usize, offset: i64) -> TimeSeriesTable {
        let start = Utc.with_ymd_and_hms(2012, 9, 1, 0, 0, 0).unwrap();
        TimeSeriesTable::new(
            (0..rows)
                .map(|h| start + Duration::hours(offset + h as i64))
                .collect(),
            vec![Column::categorical(
                "weather",
                (0..rows)
                    .map(|h| Some(if h % 2 == 0 { "clear" } else { "rain" }.to_string()))
                    .collect(),
            )],
        )
        .unwrap()
    }

    fn forecaster(lags: LagSpec, window: usize) -> RecursiveForecaster {
        RecursiveForecaster::new(
            LightgbmParams::default(),
            lags,
            RollingFeatures::mean(window).unwrap(),
            OrdinalEncoder::new(),
            &PersistenceFactory,
        )
        .unwrap()
    }

    #[test]
    fn window_size_covers_lags_and_rolling_window() {
        assert_eq!(forecaster(LagSpec::Window(3), 5).window_size(), 5);
        assert_eq!(
            forecaster(LagSpec::Explicit(vec![1, 24, 168]), 72).window_size(),
            168
        );
        assert_eq!(
            forecaster(LagSpec::Window(2), 3).feature_names(),
            vec!["lag_1", "lag_2", "roll_mean_3"]
        );
    }

    #[test]
    fn predictions_feed_back_as_lags() {
        let mut model = forecaster(LagSpec::Window(2), 2);
        let target: Vec<f64> = (0..10).map(|v| v as f64).collect();
        model.fit(&target, &exog(10, 0)).unwrap();
        assert_eq!(model.feature_names().len(), 4);

        let predictions = model.predict(3, &exog(5, 10)).unwrap();
        assert_eq!(predictions, vec![9.0, 9.0, 9.0]);
    }

    #[test]
    fn predict_requires_contiguous_exogenous_rows() {
        let mut model = forecaster(LagSpec::Window(2), 2);
        let target: Vec<f64> = (0..10).map(|v| v as f64).collect();
        model.fit(&target, &exog(10, 0)).unwrap();
        assert!(model.predict(3, &exog(5, 12)).is_err());
        assert!(model.predict(6, &exog(5, 10)).is_err());
    }

    #[test]
    fn fit_rejects_series_shorter_than_window() {
        let mut model = forecaster(LagSpec::Window(5), 5);
        let target = vec![1.0; 5];
        assert!(model.fit(&target, &exog(5, 0)).is_err());
        assert!(!model.is_fitted());
    }

    #[test]
    fn backtest_scores_persistence_on_a_ramp() {
        let mut model = forecaster(LagSpec::Window(1), 1);
        let target: Vec<f64> = (0..20).map(|v| v as f64).collect();
        // Folds of 2 starting at 10: persistence misses by 1 then 2.
        let mae = model.backtest(&target, &exog(20, 0), 10, 2).unwrap();
        assert!((mae - 1.5).abs() < 1e-12, "{mae}");
    }

    #[test]
    fn backtest_needs_rows_after_initial_train_size() {
        let mut model = forecaster(LagSpec::Window(1), 1);
        let target = vec![1.0; 10];
        assert!(model.backtest(&target, &exog(10, 0), 10, 2).is_err());
    }
}
