use crate::http_client::HttpClientOptions;
use crate::market_data::{normalize_ticker_symbol, MarketData};
use crate::provider::{HttpPriceProvider, PriceDataProvider};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::info;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Fetches every ticker over `[start, end]` into one in-memory snapshot.
pub async fn collect<P: PriceDataProvider>(
    provider: &P,
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<MarketData> {
    if start > end {
        return Err(anyhow!("start {} is after end {}", start, end));
    }
    let symbols: BTreeSet<String> = tickers
        .iter()
        .filter_map(|ticker| normalize_ticker_symbol(ticker))
        .collect();
    if symbols.is_empty() {
        return Err(anyhow!("no tickers to export"));
    }

    let mut series = BTreeMap::new();
    for symbol in symbols {
        let bars = provider
            .fetch_series(&symbol, start, end)
            .await
            .with_context(|| format!("failed to fetch {} for snapshot", symbol))?;
        info!("Fetched {} bars for {}", bars.len(), symbol);
        series.insert(symbol, bars);
    }
    Ok(MarketData::from_series(series))
}

pub async fn run(
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
    provider_url: &str,
    output_path: &Path,
) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let provider = HttpPriceProvider::new(provider_url, &HttpClientOptions::from_env())?;
    let market_data = collect(&provider, tickers, start, end).await?;

    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot with {} bars written to {}",
        market_data.bar_count(),
        output_path.display()
    );

    Ok(())
}
