use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_N_TRIALS: usize = 10;
pub const DEFAULT_RANDOM_STATE: u64 = 2025;
pub const DEFAULT_INITIAL_TRAIN_FRACTION: f64 = 0.9;
pub const DEFAULT_FORECAST_HOURS: usize = 36;
pub const DEFAULT_WINDOW_SIZES: usize = 72;

const SETTING_KEYS: &[&str] = &[
    "DATABASE_URL",
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "DB_SCHEMA",
    "DB_TABLE",
    "FORECAST_N_TRIALS",
    "FORECAST_RANDOM_STATE",
    "FORECAST_INITIAL_TRAIN_FRACTION",
    "LIGHTGBM_EXECUTABLE",
];

/// Collects the engine's settings from the process environment.
pub fn settings_from_env() -> HashMap<String, String> {
    SETTING_KEYS
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .map(|value| (key.to_string(), value))
        })
        .collect()
}

/// Where the feature table lives in PostgreSQL.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    /// Plaintext or an `enc:v1:` ciphertext; decrypted when connecting.
    pub password: String,
    pub schema: String,
    pub table: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            schema: "application".to_string(),
            table: "feature".to_string(),
        }
    }
}

impl DatabaseSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let port = match optional_setting(settings, "DB_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| anyhow!("Setting DB_PORT must be a port number (value: {})", raw))?,
            None => defaults.port,
        };
        let schema = setting_or(settings, "DB_SCHEMA", &defaults.schema);
        let table = setting_or(settings, "DB_TABLE", &defaults.table);
        require_identifier("DB_SCHEMA", &schema)?;
        require_identifier("DB_TABLE", &table)?;

        Ok(Self {
            url: optional_setting(settings, "DATABASE_URL").map(str::to_string),
            host: setting_or(settings, "DB_HOST", &defaults.host),
            port,
            name: setting_or(settings, "DB_NAME", &defaults.name),
            user: setting_or(settings, "DB_USER", &defaults.user),
            password: settings
                .get("DB_PASSWORD")
                .map(|value| value.trim().to_string())
                .unwrap_or_default(),
            schema,
            table,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ForecastSettings {
    pub n_trials: usize,
    pub random_state: u64,
    pub initial_train_fraction: f64,
    pub lightgbm_executable: Option<PathBuf>,
    pub database: DatabaseSettings,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            n_trials: DEFAULT_N_TRIALS,
            random_state: DEFAULT_RANDOM_STATE,
            initial_train_fraction: DEFAULT_INITIAL_TRAIN_FRACTION,
            lightgbm_executable: None,
            database: DatabaseSettings::default(),
        }
    }
}

impl ForecastSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let n_trials = match optional_setting(settings, "FORECAST_N_TRIALS") {
            Some(_) => require_setting_usize(settings, "FORECAST_N_TRIALS", 1)?,
            None => DEFAULT_N_TRIALS,
        };
        let random_state = match optional_setting(settings, "FORECAST_RANDOM_STATE") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                anyhow!(
                    "Setting FORECAST_RANDOM_STATE must be a non-negative integer (value: {})",
                    raw
                )
            })?,
            None => DEFAULT_RANDOM_STATE,
        };
        let initial_train_fraction =
            match optional_setting(settings, "FORECAST_INITIAL_TRAIN_FRACTION") {
                Some(_) => require_setting_f64(
                    settings,
                    "FORECAST_INITIAL_TRAIN_FRACTION",
                    Some(0.0),
                    Some(1.0),
                )?,
                None => DEFAULT_INITIAL_TRAIN_FRACTION,
            };
        if initial_train_fraction <= 0.0 || initial_train_fraction >= 1.0 {
            return Err(anyhow!(
                "Setting FORECAST_INITIAL_TRAIN_FRACTION must be strictly between 0 and 1 (value: {})",
                initial_train_fraction
            ));
        }

        Ok(Self {
            n_trials,
            random_state,
            initial_train_fraction,
            lightgbm_executable: optional_setting(settings, "LIGHTGBM_EXECUTABLE")
                .map(PathBuf::from),
            database: DatabaseSettings::from_settings_map(settings)?,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_or(settings: &HashMap<String, String>, key: &str, default: &str) -> String {
    optional_setting(settings, key)
        .unwrap_or(default)
        .to_string()
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn require_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<usize> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

// Schema and table names are interpolated into quoted SQL identifiers.
fn require_identifier(key: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(anyhow!(
            "Setting {} must contain only letters, digits and underscores (value: {})",
            key,
            value
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_settings_are_absent() {
        let parsed = ForecastSettings::from_settings_map(&HashMap::new()).expect("defaults");
        assert_eq!(parsed.n_trials, DEFAULT_N_TRIALS);
        assert_eq!(parsed.random_state, DEFAULT_RANDOM_STATE);
        assert_eq!(parsed.database.schema, "application");
        assert_eq!(parsed.database.table, "feature");
        assert_eq!(parsed.database.port, 5432);
        assert!(parsed.lightgbm_executable.is_none());
    }

    #[test]
    fn explicit_settings_override_defaults() {
        let parsed = ForecastSettings::from_settings_map(&settings(&[
            ("FORECAST_N_TRIALS", "25"),
            ("FORECAST_RANDOM_STATE", "15926"),
            ("FORECAST_INITIAL_TRAIN_FRACTION", "0.8"),
            ("DB_SCHEMA", "public"),
            ("DB_TABLE", "data_table"),
            ("DB_PORT", "6543"),
        ]))
        .expect("valid settings");
        assert_eq!(parsed.n_trials, 25);
        assert_eq!(parsed.random_state, 15926);
        assert!((parsed.initial_train_fraction - 0.8).abs() < 1e-12);
        assert_eq!(parsed.database.schema, "public");
        assert_eq!(parsed.database.table, "data_table");
        assert_eq!(parsed.database.port, 6543);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(
            ForecastSettings::from_settings_map(&settings(&[("FORECAST_N_TRIALS", "0")])).is_err()
        );
        assert!(ForecastSettings::from_settings_map(&settings(&[(
            "FORECAST_INITIAL_TRAIN_FRACTION",
            "1.0"
        )]))
        .is_err());
        assert!(
            ForecastSettings::from_settings_map(&settings(&[("DB_TABLE", "feature; DROP")]))
                .is_err()
        );
        assert!(ForecastSettings::from_settings_map(&settings(&[("DB_PORT", "abc")])).is_err());
    }
}
