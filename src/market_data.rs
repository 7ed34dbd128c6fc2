use crate::config::AlignmentPolicy;
use crate::error::{BacktestError, Result as BacktestResult};
use crate::models::PriceBar;
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    series: BTreeMap<String, Vec<PriceBar>>,
}

/// Normalizes a ticker string by trimming whitespace and uppercasing.
pub fn normalize_ticker_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Sorts bars by date and drops repeated dates, keeping the last bar seen for a date.
pub fn sort_and_dedup_bars(mut bars: Vec<PriceBar>) -> Vec<PriceBar> {
    bars.sort_by_key(|bar| bar.date);
    let mut deduped: Vec<PriceBar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match deduped.last_mut() {
            Some(last) if last.date == bar.date => *last = bar,
            _ => deduped.push(bar),
        }
    }
    deduped
}

/// In-memory price series keyed by ticker.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: Arc<BTreeMap<String, Vec<PriceBar>>>,
}

impl MarketData {
    pub fn from_series(series: BTreeMap<String, Vec<PriceBar>>) -> Self {
        let series = series
            .into_iter()
            .filter_map(|(ticker, bars)| {
                normalize_ticker_symbol(&ticker).map(|symbol| (symbol, sort_and_dedup_bars(bars)))
            })
            .collect();
        Self {
            series: Arc::new(series),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot = if is_json_path(path) {
            serde_json::from_reader(reader).context("Snapshot JSON decode failed")?
        } else {
            bincode::deserialize_from(reader).context("Snapshot decode failed")?
        };

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let market_data = Self::from_series(snapshot.series);
        if !market_data.has_data() {
            return Err(anyhow!(
                "Market data snapshot at {} has no usable price series",
                path.display()
            ));
        }
        info!(
            "Loaded {} bars for {} tickers from {}",
            market_data.bar_count(),
            market_data.tickers().len(),
            path.display()
        );
        Ok(market_data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            series: self.series.as_ref().clone(),
        };
        if is_json_path(path) {
            serde_json::to_writer(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot as JSON")?;
        } else {
            bincode::serialize_into(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?;
        }
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        self.series.values().any(|bars| !bars.is_empty())
    }

    pub fn tickers(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn bar_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Bars for `ticker` dated within `[start, end]`.
    pub fn bars_in_range(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> &[PriceBar] {
        let Some(bars) = self.series.get(ticker) else {
            return &[];
        };
        let from = bars.partition_point(|bar| bar.date < start);
        let to = bars.partition_point(|bar| bar.date <= end);
        if from >= to {
            &[]
        } else {
            &bars[from..to]
        }
    }
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Day-indexed closes and dividends for every ticker of one portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    tickers: Vec<String>,
    dates: Vec<NaiveDate>,
    closes: Vec<Vec<f64>>,
    dividends: Vec<Vec<f64>>,
}

impl PriceTable {
    /// Aligns per-ticker series restricted to `[start, end]`.
    ///
    /// Every ticker must have at least one bar in range, otherwise the whole table
    /// is rejected with `DataUnavailable`.
    pub fn align(
        series: &BTreeMap<String, Vec<PriceBar>>,
        start: NaiveDate,
        end: NaiveDate,
        policy: AlignmentPolicy,
    ) -> BacktestResult<Self> {
        if series.is_empty() {
            return Err(BacktestError::invalid_parameters(
                "portfolio has no tickers to align",
            ));
        }

        let mut windows: BTreeMap<&str, Vec<&PriceBar>> = BTreeMap::new();
        for (ticker, bars) in series {
            let in_range: Vec<&PriceBar> = bars
                .iter()
                .filter(|bar| bar.date >= start && bar.date <= end)
                .collect();
            if in_range.is_empty() {
                return Err(BacktestError::data_unavailable(
                    ticker.as_str(),
                    format!("no bars between {} and {}", start, end),
                ));
            }
            windows.insert(ticker.as_str(), in_range);
        }

        let dates = match policy {
            AlignmentPolicy::Intersection => intersect_dates(&windows),
            AlignmentPolicy::ForwardFill => union_dates_after_common_start(&windows),
        };
        if dates.is_empty() {
            let ticker = windows.keys().next().copied().unwrap_or_default();
            return Err(BacktestError::data_unavailable(
                ticker,
                format!(
                    "tickers share no trading dates between {} and {} ({} alignment)",
                    start,
                    end,
                    policy.label()
                ),
            ));
        }

        let tickers: Vec<String> = windows.keys().map(|ticker| ticker.to_string()).collect();
        let mut closes = vec![Vec::with_capacity(tickers.len()); dates.len()];
        let mut dividends = vec![Vec::with_capacity(tickers.len()); dates.len()];

        for bars in windows.values() {
            let mut cursor = 0usize;
            let mut last_close: Option<f64> = None;
            for (row, date) in dates.iter().enumerate() {
                while cursor < bars.len() && bars[cursor].date < *date {
                    last_close = Some(bars[cursor].close);
                    cursor += 1;
                }
                if cursor < bars.len() && bars[cursor].date == *date {
                    closes[row].push(bars[cursor].close);
                    dividends[row].push(bars[cursor].dividend);
                    last_close = Some(bars[cursor].close);
                    cursor += 1;
                } else {
                    // Only reachable under forward fill, after the ticker's first bar.
                    closes[row].push(last_close.unwrap_or(f64::NAN));
                    dividends[row].push(0.0);
                }
            }
        }

        Ok(Self {
            tickers,
            dates,
            closes,
            dividends,
        })
    }

    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn date(&self, day: usize) -> NaiveDate {
        self.dates[day]
    }

    pub fn ticker_index(&self, ticker: &str) -> Option<usize> {
        self.tickers.iter().position(|candidate| candidate == ticker)
    }

    pub fn closes(&self, day: usize) -> &[f64] {
        &self.closes[day]
    }

    pub fn close(&self, day: usize, ticker_index: usize) -> f64 {
        self.closes[day][ticker_index]
    }

    pub fn dividend(&self, day: usize, ticker_index: usize) -> f64 {
        self.dividends[day][ticker_index]
    }
}

fn intersect_dates(windows: &BTreeMap<&str, Vec<&PriceBar>>) -> Vec<NaiveDate> {
    let mut iter = windows.values();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    let mut common: BTreeSet<NaiveDate> = first.iter().map(|bar| bar.date).collect();
    for bars in iter {
        let dates: BTreeSet<NaiveDate> = bars.iter().map(|bar| bar.date).collect();
        common = common.intersection(&dates).copied().collect();
    }
    common.into_iter().collect()
}

fn union_dates_after_common_start(windows: &BTreeMap<&str, Vec<&PriceBar>>) -> Vec<NaiveDate> {
    let Some(common_start) = windows
        .values()
        .filter_map(|bars| bars.first().map(|bar| bar.date))
        .max()
    else {
        return Vec::new();
    };
    let all: BTreeSet<NaiveDate> = windows
        .values()
        .flat_map(|bars| bars.iter().map(|bar| bar.date))
        .filter(|date| *date >= common_start)
        .collect();
    all.into_iter().collect()
}
