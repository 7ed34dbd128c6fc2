use crate::error::{BacktestError, Result};
use crate::http_client::{build_async_client, HttpClientOptions};
use crate::market_data::{normalize_ticker_symbol, sort_and_dedup_bars, MarketData};
use crate::models::PriceBar;
use crate::retry::{retry_rate_limited, RetryPolicy};
use chrono::NaiveDate;
use log::debug;
use reqwest::{Client, StatusCode};

/// Source of daily bars for one ticker over an inclusive date range.
///
/// Implementations fail with `DataUnavailable` when the ticker is unknown or has no
/// bars in range, and with `RateLimited` when throttled after their own retries.
#[allow(async_fn_in_trait)]
pub trait PriceDataProvider {
    async fn fetch_series(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>>;
}

fn normalized_or_invalid(ticker: &str) -> Result<String> {
    normalize_ticker_symbol(ticker)
        .ok_or_else(|| BacktestError::invalid_parameters(format!("invalid ticker '{}'", ticker)))
}

/// Serves bars from an already loaded snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotProvider {
    data: MarketData,
}

impl SnapshotProvider {
    pub fn new(data: MarketData) -> Self {
        Self { data }
    }
}

impl PriceDataProvider for SnapshotProvider {
    async fn fetch_series(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let ticker = normalized_or_invalid(ticker)?;
        let bars = self.data.bars_in_range(&ticker, start, end);
        if bars.is_empty() {
            return Err(BacktestError::data_unavailable(
                ticker,
                format!("no bars between {} and {} in snapshot", start, end),
            ));
        }
        Ok(bars.to_vec())
    }
}

/// Fetches bars from `GET {base_url}/prices/{ticker}?start=YYYY-MM-DD&end=YYYY-MM-DD`.
#[derive(Debug, Clone)]
pub struct HttpPriceProvider {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpPriceProvider {
    pub fn new(base_url: &str, options: &HttpClientOptions) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_async_client(options)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_once(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let url = format!("{}/prices/{}", self.base_url, ticker);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("start", start.format("%Y-%m-%d").to_string()),
                ("end", end.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await
            .map_err(|err| BacktestError::provider(format!("GET {} failed: {}", url, err)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BacktestError::rate_limited(
                ticker,
                format!("provider responded {}", status),
            ));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BacktestError::data_unavailable(ticker, "unknown ticker"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BacktestError::provider(format!(
                "GET {} responded {}: {}",
                url,
                status,
                body.trim()
            )));
        }

        let bars: Vec<PriceBar> = response.json().await.map_err(|err| {
            BacktestError::provider(format!("failed to decode bars for {}: {}", ticker, err))
        })?;
        let bars: Vec<PriceBar> = sort_and_dedup_bars(bars)
            .into_iter()
            .filter(|bar| bar.date >= start && bar.date <= end)
            .collect();
        if bars.is_empty() {
            return Err(BacktestError::data_unavailable(
                ticker,
                format!("no bars between {} and {}", start, end),
            ));
        }
        debug!("Fetched {} bars for {} from {}", bars.len(), ticker, self.base_url);
        Ok(bars)
    }
}

impl PriceDataProvider for HttpPriceProvider {
    async fn fetch_series(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        let ticker = normalized_or_invalid(ticker)?;
        retry_rate_limited!(
            format!("price fetch for {}", ticker),
            self.retry,
            self.fetch_once(&ticker, start, end)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 5, day).unwrap()
    }

    #[tokio::test]
    async fn snapshot_provider_normalizes_and_slices() {
        let mut series = BTreeMap::new();
        series.insert(
            "AAA".to_string(),
            (1..=5).map(|day| PriceBar::flat(date(day), 10.0)).collect(),
        );
        let provider = SnapshotProvider::new(MarketData::from_series(series));

        let bars = provider.fetch_series(" aaa ", date(2), date(3)).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, date(2));

        let missing = provider.fetch_series("ZZZ", date(1), date(5)).await.unwrap_err();
        assert_eq!(missing.kind(), "data_unavailable");

        let invalid = provider.fetch_series("   ", date(1), date(5)).await.unwrap_err();
        assert_eq!(invalid.kind(), "invalid_parameters");
    }
}
