use crate::analytics::{calculate_annual_returns, PerformanceCalculator};
use crate::config::EngineSettings;
use crate::error::{BacktestError, Result};
use crate::ledger::{BrokerAccount, OrderSize};
use crate::market_data::PriceTable;
use crate::models::*;
use crate::rebalance::{plan_rebalance, HoldingView, RebalanceBands, RebalanceIssue};
use crate::schedule::DueSchedule;
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop flag shared by every run of a batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Running,
    Completed,
}

/// Mutable aggregate owned by one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationState {
    pub account: BrokerAccount,
    pub day_counter: usize,
    pub inflation_factor: f64,
    pub dividends_pending: BTreeMap<String, f64>,
    pub dividends_paid_out: f64,
    pub initial_invested: bool,
    pub rebalance_schedule: DueSchedule,
    pub cashflow_schedule: DueSchedule,
    running_max: f64,
    samples: Vec<ValueSample>,
    trades: Vec<TradeRecord>,
}

impl SimulationState {
    pub fn samples(&self) -> &[ValueSample] {
        &self.samples
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOutcome {
    pub samples: Vec<ValueSample>,
    pub final_cash: f64,
    pub positions: BTreeMap<String, f64>,
    pub trades: Vec<TradeRecord>,
    pub cash_events: Vec<CashEvent>,
    pub dividends_paid_out: f64,
}

impl SimulationOutcome {
    pub fn final_value(&self) -> f64 {
        self.samples
            .last()
            .map(|sample| sample.portfolio_value)
            .unwrap_or(0.0)
    }
}

/// One pass over an aligned price table for one portfolio.
pub struct Simulation<'a> {
    settings: &'a EngineSettings,
    table: &'a PriceTable,
    portfolio: &'a PortfolioItem,
    params: RunParameters,
    weights: Vec<f64>,
    phase: EngineState,
    state: SimulationState,
}

impl<'a> Simulation<'a> {
    pub fn new(
        settings: &'a EngineSettings,
        table: &'a PriceTable,
        portfolio: &'a PortfolioItem,
        params: RunParameters,
    ) -> Result<Self> {
        if !params.initial_capital.is_finite() || params.initial_capital < 0.0 {
            return Err(BacktestError::invalid_parameters(format!(
                "initial capital must be a non-negative number (value: {})",
                params.initial_capital
            )));
        }
        if !params.cashflow.is_finite() {
            return Err(BacktestError::invalid_parameters(format!(
                "cashflow must be finite (value: {})",
                params.cashflow
            )));
        }
        for (ticker, weight) in &portfolio.allocation {
            if !weight.is_finite() {
                return Err(BacktestError::invalid_parameters(format!(
                    "target weight for {} must be finite (value: {})",
                    ticker, weight
                )));
            }
            if table.ticker_index(ticker).is_none() {
                return Err(BacktestError::data_unavailable(
                    ticker.as_str(),
                    "no aligned price series for portfolio ticker",
                ));
            }
        }
        let Some(&first_date) = table.dates().first() else {
            return Err(BacktestError::data_unavailable(
                table.tickers().first().cloned().unwrap_or_default(),
                "price table has no trading days",
            ));
        };

        let weights = table
            .tickers()
            .iter()
            .map(|ticker| portfolio.target_weight(ticker))
            .collect();
        let horizon = settings.schedule_horizon_periods;

        Ok(Self {
            settings,
            table,
            portfolio,
            params,
            weights,
            phase: EngineState::NotStarted,
            state: SimulationState {
                account: BrokerAccount::new(params.initial_capital, settings.commission_rate),
                day_counter: 0,
                inflation_factor: 1.0,
                dividends_pending: BTreeMap::new(),
                dividends_paid_out: 0.0,
                initial_invested: false,
                rebalance_schedule: DueSchedule::resolve(
                    first_date,
                    portfolio.rebalance_freq,
                    horizon,
                ),
                cashflow_schedule: DueSchedule::resolve(first_date, params.cashflow_freq, horizon),
                running_max: 0.0,
                samples: Vec::with_capacity(table.len()),
                trades: Vec::new(),
            },
        })
    }

    pub fn phase(&self) -> EngineState {
        self.phase
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    /// Advances one trading day. Calling it after completion is a no-op.
    pub fn step(&mut self) -> Result<EngineState> {
        if self.phase == EngineState::Completed {
            return Ok(self.phase);
        }
        self.phase = EngineState::Running;

        let day = self.state.day_counter;
        let date = self.table.date(day);
        self.check_closes(day, date)?;

        if !self.state.initial_invested {
            self.invest_initial_capital(day, date)?;
            self.state.initial_invested = true;
        }
        if self.params.adjust_inflation {
            self.update_inflation_factor(date)?;
        }
        self.settle_pending_dividends(date)?;
        self.inject_cashflows(date)?;
        if self.state.rebalance_schedule.take_due(date) > 0 {
            self.rebalance(day, date)?;
        }
        self.record_sample(day, date)?;

        self.state.day_counter += 1;
        if self.state.day_counter >= self.table.len() {
            self.phase = EngineState::Completed;
        }
        Ok(self.phase)
    }

    /// Steps until completion, checking `cancel` before every day.
    pub fn run(mut self, cancel: &CancellationToken) -> Result<SimulationOutcome> {
        while self.phase != EngineState::Completed {
            if cancel.is_cancelled() {
                return Err(BacktestError::Cancelled {
                    date: self.table.date(self.state.day_counter),
                });
            }
            self.step()?;
        }
        self.into_outcome()
    }

    pub fn into_outcome(self) -> Result<SimulationOutcome> {
        if self.phase != EngineState::Completed {
            let day = self.state.day_counter.min(self.table.len().saturating_sub(1));
            return Err(BacktestError::simulation(
                self.table.date(day),
                None,
                "simulation has not completed",
            ));
        }
        let SimulationState {
            account,
            dividends_paid_out,
            samples,
            trades,
            ..
        } = self.state;
        Ok(SimulationOutcome {
            samples,
            final_cash: account.cash.cash(),
            positions: account.positions.snapshot(),
            trades,
            cash_events: account.cash.events().to_vec(),
            dividends_paid_out,
        })
    }

    fn check_closes(&self, day: usize, date: NaiveDate) -> Result<()> {
        for (ticker, close) in self.table.tickers().iter().zip(self.table.closes(day)) {
            if !close.is_finite() || *close <= 0.0 {
                return Err(BacktestError::simulation(
                    date,
                    Some(ticker.as_str()),
                    format!("close price {} is not a positive number", close),
                ));
            }
        }
        Ok(())
    }

    fn invest_initial_capital(&mut self, day: usize, date: NaiveDate) -> Result<()> {
        let table = self.table;
        let total_cash = self.state.account.cash.cash();
        // Weights above 100% in total are scaled down so every ticker keeps its share.
        let weight_sum: f64 = self.weights.iter().filter(|weight| **weight > 0.0).sum();
        let scale = if weight_sum > 100.0 { 100.0 / weight_sum } else { 1.0 };
        let commission_factor = 1.0 + self.state.account.commission_rate();
        for (index, ticker) in table.tickers().iter().enumerate() {
            let weight = self.weights[index];
            if weight <= 0.0 {
                debug!(
                    "{} {}: skipping {} in initial allocation (target weight {})",
                    date, self.portfolio.name, ticker, weight
                );
                continue;
            }
            let close = table.close(day, index);
            let notional = total_cash * (weight * scale / 100.0) / commission_factor;
            if notional <= 0.0 {
                debug!(
                    "{} {}: skipping {} in initial allocation (size {})",
                    date, self.portfolio.name, ticker, notional
                );
                continue;
            }
            if let Some(trade) =
                self.state
                    .account
                    .buy(date, ticker, OrderSize::Notional(notional), close)?
            {
                debug!(
                    "{} {}: initial buy {:.4} {} @ {:.2}",
                    date, self.portfolio.name, trade.shares, ticker, close
                );
                self.state.trades.push(trade);
            }
        }
        Ok(())
    }

    fn update_inflation_factor(&mut self, date: NaiveDate) -> Result<()> {
        let factor = self.settings.inflation_factor(date.year());
        if !factor.is_finite() || factor <= 0.0 {
            return Err(BacktestError::simulation(
                date,
                None,
                format!("inflation factor {} is not a positive number", factor),
            ));
        }
        self.state.inflation_factor = factor;
        Ok(())
    }

    fn settle_pending_dividends(&mut self, date: NaiveDate) -> Result<()> {
        let pending = std::mem::take(&mut self.state.dividends_pending);
        for (ticker, amount) in pending {
            if amount <= 0.0 {
                continue;
            }
            if self.portfolio.invest_dividends {
                self.state
                    .account
                    .cash
                    .deposit(date, CashEventKind::Dividend, amount)?;
                debug!(
                    "{} {}: reinvesting {:.2} dividend from {}",
                    date, self.portfolio.name, amount, ticker
                );
            } else {
                self.state.dividends_paid_out += amount;
            }
        }
        Ok(())
    }

    fn inject_cashflows(&mut self, date: NaiveDate) -> Result<()> {
        let fired = self.state.cashflow_schedule.take_due(date);
        if fired == 0 || self.params.cashflow <= 0.0 {
            return Ok(());
        }
        let amount = self.params.cashflow / self.state.inflation_factor;
        for _ in 0..fired {
            self.state
                .account
                .cash
                .deposit(date, CashEventKind::Cashflow, amount)?;
        }
        debug!(
            "{} {}: injected {} cashflow(s) of {:.2}",
            date, self.portfolio.name, fired, amount
        );
        Ok(())
    }

    fn mark_to_market(&self, day: usize) -> f64 {
        let table = self.table;
        let closes = table.closes(day);
        self.state.account.broker_value(|ticker| {
            table
                .ticker_index(ticker)
                .map(|index| closes[index])
                .unwrap_or(0.0)
        })
    }

    fn rebalance(&mut self, day: usize, date: NaiveDate) -> Result<()> {
        let table = self.table;
        let total_value = self.mark_to_market(day);
        let holdings: Vec<HoldingView<'_>> = table
            .tickers()
            .iter()
            .enumerate()
            .map(|(index, ticker)| HoldingView {
                ticker: ticker.as_str(),
                shares: self.state.account.positions.shares(ticker),
                close: table.close(day, index),
                target_weight_pct: self.weights[index],
            })
            .collect();
        let bands = RebalanceBands {
            abs_band_pct: self.settings.abs_band_pct,
            rel_band_pct: self.settings.rel_band_pct,
        };

        let orders = plan_rebalance(&holdings, total_value, bands).map_err(|issue| match issue {
            RebalanceIssue::NonFiniteBand { ticker } => BacktestError::simulation(
                date,
                Some(ticker.as_str()),
                "rebalance band produced a non-finite threshold",
            ),
            RebalanceIssue::InvalidPrice { ticker, price } => BacktestError::simulation(
                date,
                Some(ticker.as_str()),
                format!("cannot size rebalance order at price {}", price),
            ),
        })?;

        for order in orders {
            let Some(index) = table.ticker_index(&order.ticker) else {
                continue;
            };
            let price = table.close(day, index);
            let fill = match order.side {
                TradeSide::Sell => self
                    .state
                    .account
                    .sell(date, &order.ticker, order.shares, price)?,
                TradeSide::Buy => self.state.account.buy(
                    date,
                    &order.ticker,
                    OrderSize::Shares(order.shares),
                    price,
                )?,
            };
            if let Some(trade) = fill {
                debug!(
                    "{} {}: rebalance {:?} {:.4} {} @ {:.2}",
                    date, self.portfolio.name, trade.side, trade.shares, trade.ticker, price
                );
                self.state.trades.push(trade);
            }
        }
        Ok(())
    }

    fn record_sample(&mut self, day: usize, date: NaiveDate) -> Result<()> {
        let raw_value = self.mark_to_market(day);
        if !raw_value.is_finite() {
            return Err(BacktestError::simulation(
                date,
                None,
                format!("portfolio value {} is not finite", raw_value),
            ));
        }
        let portfolio_value = round2(raw_value);
        if portfolio_value > self.state.running_max {
            self.state.running_max = portfolio_value;
        }
        let running_max = self.state.running_max;
        let drawdown = if running_max > 0.0 && portfolio_value < running_max {
            ((running_max - portfolio_value) / running_max * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.state.samples.push(ValueSample {
            date,
            portfolio_value,
            drawdown_value: round2(drawdown),
        });

        let table = self.table;
        for (index, ticker) in table.tickers().iter().enumerate() {
            let dividend = table.dividend(day, index);
            if !dividend.is_finite() || dividend <= 0.0 {
                continue;
            }
            let shares = self.state.account.positions.shares(ticker);
            if shares > 0.0 {
                *self
                    .state
                    .dividends_pending
                    .entry(ticker.clone())
                    .or_insert(0.0) += shares * dividend;
            }
        }
        Ok(())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Runs portfolios against already fetched price series.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    settings: EngineSettings,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn simulate(
        &self,
        table: &PriceTable,
        portfolio: &PortfolioItem,
        params: RunParameters,
        cancel: &CancellationToken,
    ) -> Result<SimulationOutcome> {
        Simulation::new(&self.settings, table, portfolio, params)?.run(cancel)
    }

    /// Aligns the portfolio's series over `[start_date, end_date]`, simulates it and
    /// reduces the samples into the result series.
    ///
    /// Every ticker in the allocation must be present in `series`.
    pub fn run_backtest(
        &self,
        series: &BTreeMap<String, Vec<PriceBar>>,
        start_date: NaiveDate,
        end_date: NaiveDate,
        portfolio: &PortfolioItem,
        params: RunParameters,
        cancel: &CancellationToken,
    ) -> Result<BacktestSeries> {
        let mut portfolio_series = BTreeMap::new();
        for ticker in portfolio.allocation.keys() {
            let Some(bars) = series.get(ticker) else {
                return Err(BacktestError::data_unavailable(
                    ticker.as_str(),
                    "no price series supplied",
                ));
            };
            portfolio_series.insert(ticker.clone(), bars.clone());
        }

        let table = PriceTable::align(
            &portfolio_series,
            start_date,
            end_date,
            self.settings.alignment,
        )?;
        let outcome = self.simulate(&table, portfolio, params, cancel)?;

        info!(
            "Completed backtest for {}: {} days, {} trades, final value {:.2}",
            portfolio.name,
            outcome.samples.len(),
            outcome.trades.len(),
            outcome.final_value()
        );

        let annual_returns = calculate_annual_returns(&outcome.samples);
        let summary = PerformanceCalculator::summarize(&outcome.samples);
        Ok(BacktestSeries {
            name: portfolio.name.clone(),
            date: outcome.samples.iter().map(|sample| sample.date).collect(),
            performance: outcome
                .samples
                .iter()
                .map(|sample| sample.portfolio_value)
                .collect(),
            drawdown: outcome
                .samples
                .iter()
                .map(|sample| sample.drawdown_value)
                .collect(),
            annual_returns,
            summary,
            final_cash: outcome.final_cash,
            positions: outcome.positions,
        })
    }
}
