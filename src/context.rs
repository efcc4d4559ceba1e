use crate::config::{settings_from_env, DatabaseSettings, ForecastSettings};
use crate::regressor::LightgbmFactory;
use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct AppContext {
    settings: ForecastSettings,
}

impl AppContext {
    pub fn initialize(settings: ForecastSettings) -> Self {
        Self { settings }
    }

    pub fn from_env() -> Result<Self> {
        let settings = ForecastSettings::from_settings_map(&settings_from_env())
            .context("invalid engine settings in environment")?;
        Ok(Self::initialize(settings))
    }

    pub fn settings(&self) -> &ForecastSettings {
        &self.settings
    }

    pub fn database_settings(&self) -> &DatabaseSettings {
        &self.settings.database
    }

    pub fn regressor_factory(&self) -> LightgbmFactory {
        LightgbmFactory::new(self.settings.lightgbm_executable.clone())
    }
}
