use crate::backtester::Backtester;
use crate::config::{EngineSettings, RequestLimits};
use crate::engine::CancellationToken;
use crate::http_client::HttpClientOptions;
use crate::market_data::MarketData;
use crate::models::{BacktestReport, BacktestRequest};
use crate::provider::{HttpPriceProvider, SnapshotProvider};
use crate::status::BacktestStatusSnapshot;
use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum PriceSource {
    Snapshot(PathBuf),
    Provider(String),
}

pub fn read_request(path: &Path) -> Result<BacktestRequest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read backtest request {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse backtest request {}", path.display()))
}

fn describe_status(snapshot: &BacktestStatusSnapshot) -> String {
    let mut line = format!(
        "Batch {}: {}/{} portfolios finished ({} completed, {} failed)",
        snapshot.phase.label(),
        snapshot.finished_portfolios(),
        snapshot.total_portfolios,
        snapshot.completed_portfolios,
        snapshot.failed_portfolios
    );
    if let Some(last) = &snapshot.last_portfolio {
        line.push_str(&format!(", last: {}", last));
    }
    line
}

fn progress_bar(total: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} portfolios")
            .map_err(|err| anyhow!("invalid progress template: {}", err))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

pub async fn run(
    request_path: &Path,
    source: PriceSource,
    output: Option<&Path>,
    cancel: CancellationToken,
) -> Result<BacktestReport> {
    let request = read_request(request_path)?;
    let settings = EngineSettings::from_env()?;
    let limits = RequestLimits::from_env()?;
    info!(
        "Backtesting {} portfolio{} from {} to {} (commission {}, bands {}%/{}%, {} alignment)",
        request.portfolio.len(),
        if request.portfolio.len() == 1 { "" } else { "s" },
        request.start_date,
        request.end_date,
        settings.commission_rate,
        settings.abs_band_pct,
        settings.rel_band_pct,
        settings.alignment.label()
    );

    let backtester = Backtester::new(settings, limits)
        .with_cancellation(cancel)
        .with_progress_bar(progress_bar(request.portfolio.len())?);
    let status = backtester.status();

    let report = match source {
        PriceSource::Snapshot(path) => {
            if !path.exists() {
                return Err(anyhow!(
                    "Market data snapshot not found at {}. Generate it with `export-market-data` first.",
                    path.display()
                ));
            }
            let data = MarketData::load_from_file(&path)?;
            backtester
                .run(&request, &SnapshotProvider::new(data))
                .await?
        }
        PriceSource::Provider(base_url) => {
            let provider = HttpPriceProvider::new(&base_url, &HttpClientOptions::from_env())?;
            backtester.run(&request, &provider).await?
        }
    };

    let snapshot = status.snapshot();
    if snapshot.failed_portfolios > 0 {
        warn!("{}", describe_status(&snapshot));
    } else {
        info!("{}", describe_status(&snapshot));
    }

    let rendered = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    match output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
            info!("Backtest report written to {}", path.display());
        }
        None => println!("{}", rendered),
    }

    Ok(report)
}
