pub mod commands;
pub mod config;
pub mod context;
pub mod data_loader;
pub mod database;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod forecaster;
pub mod models;
pub mod pipeline;
pub mod predict;
pub mod preprocessing;
pub mod regressor;
pub mod trace;
pub mod tuning;
pub mod validation;

pub use error::{ForecastError, Result};
