use crate::config::{EngineSettings, RequestLimits};
use crate::engine::{CancellationToken, Engine};
use crate::error::{BacktestError, Result};
use crate::market_data::normalize_ticker_symbol;
use crate::models::{
    BacktestReport, BacktestRequest, PortfolioItem, PortfolioOutcome, PriceBar, RunParameters,
};
use crate::provider::PriceDataProvider;
use crate::status::{BacktestStatus, BatchPhase};
use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use log::{info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

const FETCH_CONCURRENCY: usize = 4;

/// Price series fetched once per batch, plus the tickers whose fetch failed.
#[derive(Debug, Clone, Default)]
pub struct FetchedSeries {
    pub series: BTreeMap<String, Vec<PriceBar>>,
    pub failures: BTreeMap<String, BacktestError>,
}

impl FetchedSeries {
    pub fn from_series(series: BTreeMap<String, Vec<PriceBar>>) -> Self {
        Self {
            series,
            failures: BTreeMap::new(),
        }
    }

    /// First fetch failure among the portfolio's tickers, if any.
    fn failure_for(&self, item: &PortfolioItem) -> Option<&BacktestError> {
        item.allocation
            .keys()
            .find_map(|ticker| self.failures.get(ticker))
    }
}

/// Validates a request, fetches its prices and runs every portfolio in parallel.
#[derive(Clone)]
pub struct Backtester {
    engine: Engine,
    limits: RequestLimits,
    status: BacktestStatus,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
}

impl Backtester {
    pub fn new(settings: EngineSettings, limits: RequestLimits) -> Self {
        Self {
            engine: Engine::new(settings),
            limits,
            status: BacktestStatus::new(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress_bar(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn status(&self) -> BacktestStatus {
        self.status.clone()
    }

    /// Checks caller policy and returns a copy with normalized ticker symbols.
    pub fn validate_request(&self, request: &BacktestRequest) -> Result<BacktestRequest> {
        if request.start_date > request.end_date {
            return Err(BacktestError::invalid_parameters(format!(
                "start_date {} is after end_date {}",
                request.start_date, request.end_date
            )));
        }
        let span_days = (request.end_date - request.start_date).num_days();
        if span_days > self.limits.max_range_days {
            return Err(BacktestError::invalid_parameters(format!(
                "date range of {} days exceeds the maximum of {} days",
                span_days, self.limits.max_range_days
            )));
        }
        if !request.initial_capital.is_finite() || request.initial_capital <= 0.0 {
            return Err(BacktestError::invalid_parameters(format!(
                "initial_capital must be a positive number (value: {})",
                request.initial_capital
            )));
        }
        if !request.cashflow.is_finite() || request.cashflow < 0.0 {
            return Err(BacktestError::invalid_parameters(format!(
                "cashflow must be a non-negative number (value: {})",
                request.cashflow
            )));
        }
        if request.portfolio.is_empty() {
            return Err(BacktestError::invalid_parameters("portfolio list is empty"));
        }
        if request.portfolio.len() > self.limits.max_portfolios {
            return Err(BacktestError::invalid_parameters(format!(
                "{} portfolios requested, at most {} allowed",
                request.portfolio.len(),
                self.limits.max_portfolios
            )));
        }

        let mut names = HashSet::new();
        let mut portfolio = Vec::with_capacity(request.portfolio.len());
        for item in &request.portfolio {
            let name = item.name.trim();
            if name.is_empty() {
                return Err(BacktestError::invalid_parameters(
                    "portfolio name must not be empty",
                ));
            }
            if !names.insert(name.to_string()) {
                return Err(BacktestError::invalid_parameters(format!(
                    "duplicate portfolio name '{}'",
                    name
                )));
            }
            portfolio.push(normalize_portfolio(name, item)?);
        }

        Ok(BacktestRequest {
            portfolio,
            ..request.clone()
        })
    }

    pub async fn run<P: PriceDataProvider>(
        &self,
        request: &BacktestRequest,
        provider: &P,
    ) -> Result<BacktestReport> {
        self.status.set_phase(BatchPhase::Validating);
        let request = self.validate_request(request)?;

        self.status.set_phase(BatchPhase::FetchingPrices);
        let fetched = self.fetch_series(&request, provider).await;

        self.status.set_phase(BatchPhase::Simulating);
        let (start_date, end_date) = (request.start_date, request.end_date);
        let worker = self.clone();
        let portfolios = match tokio::task::spawn_blocking(move || {
            worker.run_portfolios(&request, &fetched)
        })
        .await
        {
            Ok(portfolios) => portfolios,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => return Err(BacktestError::Cancelled { date: start_date }),
        };
        self.status.set_phase(BatchPhase::Finished);

        Ok(BacktestReport {
            start_date,
            end_date,
            portfolios,
        })
    }

    /// Fetches every distinct ticker of the request once.
    pub async fn fetch_series<P: PriceDataProvider>(
        &self,
        request: &BacktestRequest,
        provider: &P,
    ) -> FetchedSeries {
        let tickers: BTreeSet<String> = request
            .portfolio
            .iter()
            .flat_map(|item| item.allocation.keys().cloned())
            .collect();
        info!(
            "Fetching {} ticker{} between {} and {}",
            tickers.len(),
            if tickers.len() == 1 { "" } else { "s" },
            request.start_date,
            request.end_date
        );

        let (start, end) = (request.start_date, request.end_date);
        let results: Vec<(String, Result<Vec<PriceBar>>)> = stream::iter(tickers)
            .map(|ticker| async move {
                let result = provider.fetch_series(&ticker, start, end).await;
                (ticker, result)
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut fetched = FetchedSeries::default();
        for (ticker, result) in results {
            match result {
                Ok(bars) => {
                    fetched.series.insert(ticker, bars);
                }
                Err(err) => {
                    warn!("Price fetch failed for {}: {}", ticker, err);
                    fetched.failures.insert(ticker, err);
                }
            }
        }
        fetched
    }

    /// Runs every portfolio on a pool of `min(portfolios, max_workers)` threads.
    ///
    /// Outcomes keep request order; one portfolio failing never affects another.
    pub fn run_portfolios(
        &self,
        request: &BacktestRequest,
        fetched: &FetchedSeries,
    ) -> Vec<PortfolioOutcome> {
        let total = request.portfolio.len();
        self.status.start_batch(total);
        if let Some(progress) = &self.progress {
            progress.set_length(total as u64);
        }

        let params = RunParameters::from(request);
        let workers = total.min(self.engine.settings().max_workers).max(1);
        info!(
            "Using {} worker thread{} for {} portfolio backtest{}",
            workers,
            if workers == 1 { "" } else { "s" },
            total,
            if total == 1 { "" } else { "s" }
        );

        let outcomes = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.install(|| {
                request
                    .portfolio
                    .par_iter()
                    .map(|item| self.run_portfolio(request, item, params, fetched))
                    .collect::<Vec<_>>()
            }),
            Err(err) => {
                warn!(
                    "Failed to build worker pool ({}); running portfolios sequentially",
                    err
                );
                request
                    .portfolio
                    .iter()
                    .map(|item| self.run_portfolio(request, item, params, fetched))
                    .collect()
            }
        };

        let failed = outcomes.iter().filter(|outcome| !outcome.is_completed()).count();
        if failed > 0 {
            warn!(
                "Backtesting completed with {} failure{}",
                failed,
                if failed == 1 { "" } else { "s" }
            );
        }
        if let Some(progress) = &self.progress {
            progress.finish_and_clear();
        }
        outcomes
    }

    fn run_portfolio(
        &self,
        request: &BacktestRequest,
        item: &PortfolioItem,
        params: RunParameters,
        fetched: &FetchedSeries,
    ) -> PortfolioOutcome {
        let started = Instant::now();
        let result = match fetched.failure_for(item) {
            Some(err) => Err(err.clone()),
            None => self.engine.run_backtest(
                &fetched.series,
                request.start_date,
                request.end_date,
                item,
                params,
                &self.cancel,
            ),
        };

        let outcome = match result {
            Ok(series) => {
                info!(
                    "Completed backtest for {} (CAGR {:.4}, Sharpe {:.4}, {:.2}s)",
                    item.name,
                    series.summary.cagr,
                    series.summary.sharpe_ratio,
                    started.elapsed().as_secs_f64()
                );
                PortfolioOutcome::Completed(series)
            }
            Err(err) => {
                warn!("Backtest failed for portfolio {}: {}", item.name, err);
                PortfolioOutcome::Failed {
                    name: item.name.clone(),
                    error_kind: err.kind().to_string(),
                    message: err.to_string(),
                }
            }
        };

        self.status
            .record_outcome(&item.name, outcome.is_completed());
        if let Some(progress) = &self.progress {
            progress.inc(1);
        }
        outcome
    }
}

fn normalize_portfolio(name: &str, item: &PortfolioItem) -> Result<PortfolioItem> {
    if item.allocation.is_empty() {
        return Err(BacktestError::invalid_parameters(format!(
            "portfolio '{}' has an empty allocation",
            name
        )));
    }

    let mut allocation = BTreeMap::new();
    for (raw_ticker, weight) in &item.allocation {
        let Some(ticker) = normalize_ticker_symbol(raw_ticker) else {
            return Err(BacktestError::invalid_parameters(format!(
                "portfolio '{}' contains an empty ticker",
                name
            )));
        };
        if !weight.is_finite() || *weight < 0.0 {
            return Err(BacktestError::invalid_parameters(format!(
                "portfolio '{}' weight for {} must be a non-negative number (value: {})",
                name, ticker, weight
            )));
        }
        if allocation.insert(ticker.clone(), *weight).is_some() {
            return Err(BacktestError::invalid_parameters(format!(
                "portfolio '{}' lists {} more than once",
                name, ticker
            )));
        }
    }

    Ok(PortfolioItem {
        name: name.to_string(),
        allocation,
        ..item.clone()
    })
}
