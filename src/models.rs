use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// One trading day for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Cash dividend per share with this bar as the ex-date.
    #[serde(default)]
    pub dividend: f64,
}

impl PriceBar {
    pub fn flat(date: NaiveDate, price: f64) -> Self {
        Self {
            date,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            dividend: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RebalanceFrequency {
    Monthly,
    Yearly,
    #[default]
    None,
}

impl RebalanceFrequency {
    /// Unrecognized values resolve to `None` so that an unknown schedule never fires.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" | "m" => Self::Monthly,
            "yearly" | "annual" | "annually" | "year" | "y" => Self::Yearly,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
            Self::None => "none",
        }
    }
}

impl Serialize for RebalanceFrequency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RebalanceFrequency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::parse).unwrap_or_default())
    }
}

/// Target allocation and policy for one portfolio in a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioItem {
    pub name: String,
    /// Ticker -> target weight in percent.
    pub allocation: BTreeMap<String, f64>,
    #[serde(default)]
    pub drag: f64,
    #[serde(default)]
    pub invest_dividends: bool,
    #[serde(default)]
    pub rebalance_freq: RebalanceFrequency,
}

impl PortfolioItem {
    pub fn target_weight(&self, ticker: &str) -> f64 {
        self.allocation.get(ticker).copied().unwrap_or(0.0)
    }

    pub fn tickers(&self) -> Vec<String> {
        self.allocation.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    #[serde(default)]
    pub cashflow: f64,
    #[serde(default)]
    pub cashflow_freq: RebalanceFrequency,
    #[serde(default)]
    pub adjust_inflation: bool,
    pub portfolio: Vec<PortfolioItem>,
}

/// Run-wide parameters shared by every portfolio in a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunParameters {
    pub initial_capital: f64,
    pub cashflow: f64,
    pub cashflow_freq: RebalanceFrequency,
    pub adjust_inflation: bool,
}

impl From<&BacktestRequest> for RunParameters {
    fn from(request: &BacktestRequest) -> Self {
        Self {
            initial_capital: request.initial_capital,
            cashflow: request.cashflow,
            cashflow_freq: request.cashflow_freq,
            adjust_inflation: request.adjust_inflation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueSample {
    pub date: NaiveDate,
    pub portfolio_value: f64,
    pub drawdown_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnualReturn {
    pub year: i32,
    #[serde(rename = "return")]
    pub return_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub date: NaiveDate,
    pub ticker: String,
    pub side: TradeSide,
    pub shares: f64,
    pub price: f64,
    pub commission: f64,
}

impl TradeRecord {
    pub fn notional(&self) -> f64 {
        self.shares * self.price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashEventKind {
    Cashflow,
    Dividend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashEvent {
    pub date: NaiveDate,
    pub kind: CashEventKind,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_return_percent: f64,
    pub cagr: f64,
    pub max_drawdown_percent: f64,
    pub longest_drawdown_days: i64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub calmar_ratio: f64,
}

/// Time series returned to callers for one completed portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSeries {
    pub name: String,
    pub date: Vec<NaiveDate>,
    pub performance: Vec<f64>,
    pub drawdown: Vec<f64>,
    pub annual_returns: Vec<AnnualReturn>,
    pub summary: PerformanceSummary,
    pub final_cash: f64,
    pub positions: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PortfolioOutcome {
    Completed(BacktestSeries),
    Failed {
        name: String,
        error_kind: String,
        message: String,
    },
}

impl PortfolioOutcome {
    pub fn name(&self) -> &str {
        match self {
            PortfolioOutcome::Completed(series) => &series.name,
            PortfolioOutcome::Failed { name, .. } => name,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PortfolioOutcome::Completed(_))
    }

    pub fn series(&self) -> Option<&BacktestSeries> {
        match self {
            PortfolioOutcome::Completed(series) => Some(series),
            PortfolioOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub portfolios: Vec<PortfolioOutcome>,
}

impl BacktestReport {
    pub fn failed_count(&self) -> usize {
        self.portfolios
            .iter()
            .filter(|outcome| !outcome.is_completed())
            .count()
    }
}
