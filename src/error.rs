use thiserror::Error;

/// Failures surfaced by the forecasting core.
///
/// `InvalidInput`, `InsufficientData` and `MissingColumn` are caller mistakes;
/// the rest are server-side failures.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InsufficientData(String),

    #[error("{0}")]
    MissingColumn(String),

    #[error("Database error: {0:#}")]
    Database(anyhow::Error),

    #[error("Pipeline failure: {0:#}")]
    Pipeline(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ForecastError>;

impl ForecastError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn insufficient_data<S: Into<String>>(message: S) -> Self {
        Self::InsufficientData(message.into())
    }

    pub fn missing_column<S: Into<String>>(message: S) -> Self {
        Self::MissingColumn(message.into())
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::InsufficientData(_) | Self::MissingColumn(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid-input",
            Self::InsufficientData(_) => "insufficient-data",
            Self::MissingColumn(_) => "missing-column",
            Self::Database(_) => "database-failure",
            Self::Pipeline(_) => "pipeline-failure",
            Self::Internal(_) => "internal-error",
        }
    }
}

impl From<std::io::Error> for ForecastError {
    fn from(err: std::io::Error) -> Self {
        ForecastError::Internal(err.to_string())
    }
}
