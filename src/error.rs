use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BacktestError>;

/// Failure taxonomy shared by the simulation core and its collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BacktestError {
    /// Malformed or out-of-policy request fields.
    #[error("Invalid parameters: {message}")]
    InvalidParameters { message: String },

    /// A ticker has no usable data in the requested range.
    #[error("No price data available for {ticker}: {message}")]
    DataUnavailable { ticker: String, message: String },

    /// The upstream price provider throttled the request.
    #[error("Price provider rate limited request for {ticker}: {message}")]
    RateLimited { ticker: String, message: String },

    /// Transport or decoding failure that is neither throttling nor missing data.
    #[error("Price provider failure: {message}")]
    Provider { message: String },

    /// Numeric fault inside a simulated day.
    #[error("Simulation failed on {date}{}: {message}", ticker_suffix(.ticker))]
    Simulation {
        date: NaiveDate,
        ticker: Option<String>,
        message: String,
    },

    #[error("Simulation cancelled before {date}")]
    Cancelled { date: NaiveDate },
}

fn ticker_suffix(ticker: &Option<String>) -> String {
    match ticker {
        Some(value) => format!(" ({})", value),
        None => String::new(),
    }
}

impl BacktestError {
    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::InvalidParameters {
            message: message.into(),
        }
    }

    pub fn data_unavailable(ticker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DataUnavailable {
            ticker: ticker.into(),
            message: message.into(),
        }
    }

    pub fn rate_limited(ticker: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RateLimited {
            ticker: ticker.into(),
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }

    pub fn simulation(date: NaiveDate, ticker: Option<&str>, message: impl Into<String>) -> Self {
        Self::Simulation {
            date,
            ticker: ticker.map(|value| value.to_string()),
            message: message.into(),
        }
    }

    /// Stable label used when a failure is serialized into a report.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameters { .. } => "invalid_parameters",
            Self::DataUnavailable { .. } => "data_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Provider { .. } => "provider",
            Self::Simulation { .. } => "simulation_error",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
