use anyhow::{Context, Result};
use reqwest::Certificate;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const PROVIDER_CA_CERT_ENV: &str = "PRICE_PROVIDER_CA_CERT";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("portfolio-backtest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq)]
pub struct HttpClientOptions {
    pub timeout: Option<Duration>,
    /// PEM bundle trusted in addition to the platform roots.
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            ca_cert_path: None,
        }
    }
}

impl HttpClientOptions {
    /// Defaults plus `PRICE_PROVIDER_CA_CERT` when it is set.
    pub fn from_env() -> Self {
        let ca_cert_path = env::var(PROVIDER_CA_CERT_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Self {
            ca_cert_path,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn load_ca_certificate(path: &PathBuf) -> Result<Certificate> {
    let pem = fs::read(path)
        .with_context(|| format!("failed to read CA certificate from {}", path.display()))?;
    Certificate::from_pem(&pem)
        .with_context(|| format!("failed to parse CA certificate from {}", path.display()))
}

pub fn build_async_client(options: &HttpClientOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(path) = &options.ca_cert_path {
        builder = builder.add_root_certificate(load_ca_certificate(path)?);
    }
    builder.build().context("failed to build HTTP client")
}
