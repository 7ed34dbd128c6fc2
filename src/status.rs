use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPhase {
    #[default]
    Validating,
    FetchingPrices,
    Simulating,
    Finished,
}

impl BatchPhase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Validating => "Validating request",
            Self::FetchingPrices => "Fetching prices",
            Self::Simulating => "Simulating portfolios",
            Self::Finished => "Finished",
        }
    }
}

/// Progress of one batch, shared between the worker pool and whoever reports it.
#[derive(Clone, Default)]
pub struct BacktestStatus {
    inner: Arc<Mutex<BacktestStatusData>>,
}

#[derive(Default)]
struct BacktestStatusData {
    phase: BatchPhase,
    total_portfolios: usize,
    completed_portfolios: usize,
    failed_portfolios: usize,
    last_portfolio: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BacktestStatusSnapshot {
    pub phase: BatchPhase,
    pub total_portfolios: usize,
    pub completed_portfolios: usize,
    pub failed_portfolios: usize,
    pub last_portfolio: Option<String>,
}

impl BacktestStatusSnapshot {
    pub fn finished_portfolios(&self) -> usize {
        self.completed_portfolios + self.failed_portfolios
    }
}

impl BacktestStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, phase: BatchPhase) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase;
        }
    }

    /// Resets counters for a batch of `total_portfolios` runs.
    pub fn start_batch(&self, total_portfolios: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.total_portfolios = total_portfolios;
            data.completed_portfolios = 0;
            data.failed_portfolios = 0;
            data.last_portfolio = None;
        }
    }

    pub fn record_outcome(&self, portfolio: &str, succeeded: bool) {
        if let Ok(mut data) = self.inner.lock() {
            if succeeded {
                data.completed_portfolios += 1;
            } else {
                data.failed_portfolios += 1;
            }
            data.last_portfolio = Some(portfolio.to_string());
        }
    }

    pub fn snapshot(&self) -> BacktestStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            BacktestStatusSnapshot {
                phase: data.phase,
                total_portfolios: data.total_portfolios,
                completed_portfolios: data.completed_portfolios,
                failed_portfolios: data.failed_portfolios,
                last_portfolio: data.last_portfolio.clone(),
            }
        } else {
            BacktestStatusSnapshot {
                phase: BatchPhase::Finished,
                total_portfolios: 0,
                completed_portfolios: 0,
                failed_portfolios: 0,
                last_portfolio: None,
            }
        }
    }
}
