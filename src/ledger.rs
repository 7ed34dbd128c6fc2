use crate::error::{BacktestError, Result};
use crate::models::{CashEvent, CashEventKind, TradeRecord, TradeSide};
use chrono::NaiveDate;
use log::debug;
use std::collections::BTreeMap;

/// Cash below this is treated as exhausted when sizing buys.
pub const CASH_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderSize {
    Notional(f64),
    Shares(f64),
}

impl OrderSize {
    fn notional_at(self, price: f64) -> f64 {
        match self {
            OrderSize::Notional(value) => value,
            OrderSize::Shares(shares) => shares * price,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CashAccount {
    cash: f64,
    events: Vec<CashEvent>,
}

impl CashAccount {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            cash: initial_cash,
            events: Vec::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn events(&self) -> &[CashEvent] {
        &self.events
    }

    /// Adds external cash. A negative amount is a caller bug and aborts the run.
    pub fn deposit(&mut self, date: NaiveDate, kind: CashEventKind, amount: f64) -> Result<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(BacktestError::simulation(
                date,
                None,
                format!("refusing to deposit invalid amount {}", amount),
            ));
        }
        self.cash += amount;
        self.events.push(CashEvent { date, kind, amount });
        Ok(())
    }

    fn debit(&mut self, amount: f64) {
        self.cash -= amount;
        if self.cash.abs() < CASH_EPSILON {
            self.cash = 0.0;
        }
    }

    fn credit(&mut self, amount: f64) {
        self.cash += amount;
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PositionLedger {
    shares: BTreeMap<String, f64>,
}

impl PositionLedger {
    pub fn shares(&self, ticker: &str) -> f64 {
        self.shares.get(ticker).copied().unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.shares.clone()
    }

    fn add(&mut self, ticker: &str, shares: f64) {
        *self.shares.entry(ticker.to_string()).or_insert(0.0) += shares;
    }

    fn remove(&mut self, ticker: &str, shares: f64) {
        if let Some(held) = self.shares.get_mut(ticker) {
            *held = (*held - shares).max(0.0);
        }
    }
}

/// Cash account and position ledger settled together at a flat commission rate.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAccount {
    pub cash: CashAccount,
    pub positions: PositionLedger,
    commission_rate: f64,
}

impl BrokerAccount {
    pub fn new(initial_cash: f64, commission_rate: f64) -> Self {
        Self {
            cash: CashAccount::new(initial_cash),
            positions: PositionLedger::default(),
            commission_rate,
        }
    }

    pub fn commission_rate(&self) -> f64 {
        self.commission_rate
    }

    /// Buys at `price`, shrinking the order so that notional plus commission fits in cash.
    ///
    /// Returns `None` when nothing could be bought.
    pub fn buy(
        &mut self,
        date: NaiveDate,
        ticker: &str,
        size: OrderSize,
        price: f64,
    ) -> Result<Option<TradeRecord>> {
        ensure_tradeable_price(date, ticker, price)?;
        let requested = size.notional_at(price);
        if !requested.is_finite() {
            return Err(BacktestError::simulation(
                date,
                Some(ticker),
                format!("buy order value is not finite ({})", requested),
            ));
        }
        if requested <= 0.0 {
            debug!("{} skipped buy for {}: non-positive order value", date, ticker);
            return Ok(None);
        }

        let affordable = (self.cash.cash() / (1.0 + self.commission_rate)).max(0.0);
        let notional = requested.min(affordable);
        if notional <= CASH_EPSILON {
            debug!(
                "{} skipped buy for {}: cash {:.2} cannot cover {:.2}",
                date,
                ticker,
                self.cash.cash(),
                requested
            );
            return Ok(None);
        }
        if notional < requested {
            debug!(
                "{} clamped buy for {} from {:.2} to {:.2} (available cash)",
                date, ticker, requested, notional
            );
        }

        let shares = notional / price;
        let commission = notional * self.commission_rate;
        self.cash.debit(notional + commission);
        self.positions.add(ticker, shares);

        Ok(Some(TradeRecord {
            date,
            ticker: ticker.to_string(),
            side: TradeSide::Buy,
            shares,
            price,
            commission,
        }))
    }

    /// Sells up to the held amount; proceeds are net of commission.
    pub fn sell(
        &mut self,
        date: NaiveDate,
        ticker: &str,
        shares: f64,
        price: f64,
    ) -> Result<Option<TradeRecord>> {
        ensure_tradeable_price(date, ticker, price)?;
        if !shares.is_finite() {
            return Err(BacktestError::simulation(
                date,
                Some(ticker),
                format!("sell size is not finite ({})", shares),
            ));
        }
        let held = self.positions.shares(ticker);
        let shares = shares.min(held);
        if shares <= 0.0 {
            debug!("{} skipped sell for {}: nothing held", date, ticker);
            return Ok(None);
        }

        let gross = shares * price;
        let commission = gross * self.commission_rate;
        self.cash.credit(gross - commission);
        self.positions.remove(ticker, shares);

        Ok(Some(TradeRecord {
            date,
            ticker: ticker.to_string(),
            side: TradeSide::Sell,
            shares,
            price,
            commission,
        }))
    }

    /// Cash plus the mark-to-market value of every position at `prices`.
    pub fn broker_value<F>(&self, mut price_of: F) -> f64
    where
        F: FnMut(&str) -> f64,
    {
        let positions_value: f64 = self
            .positions
            .shares
            .iter()
            .map(|(ticker, shares)| shares * price_of(ticker))
            .sum();
        self.cash.cash() + positions_value
    }
}

fn ensure_tradeable_price(date: NaiveDate, ticker: &str, price: f64) -> Result<()> {
    if !price.is_finite() || price <= 0.0 {
        return Err(BacktestError::simulation(
            date,
            Some(ticker),
            format!("cannot trade at price {}", price),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 1, 3).unwrap()
    }

    #[test]
    fn deposit_rejects_negative_amounts() {
        let mut account = CashAccount::new(100.0);
        account
            .deposit(day(), CashEventKind::Cashflow, 50.0)
            .unwrap();
        assert!((account.cash() - 150.0).abs() < 1e-12);
        assert_eq!(account.events().len(), 1);

        let error = account
            .deposit(day(), CashEventKind::Cashflow, -1.0)
            .unwrap_err();
        assert_eq!(error.kind(), "simulation_error");
        assert!((account.cash() - 150.0).abs() < 1e-12);
    }

    #[test]
    fn buy_charges_commission_on_notional() {
        let mut account = BrokerAccount::new(10_000.0, 0.001);
        let fill = account
            .buy(day(), "AAA", OrderSize::Notional(5_000.0), 50.0)
            .unwrap()
            .expect("buy should fill");
        assert!((fill.shares - 100.0).abs() < 1e-12);
        assert!((fill.commission - 5.0).abs() < 1e-12);
        assert!((account.cash.cash() - 4_995.0).abs() < 1e-9);
        assert!((account.positions.shares("AAA") - 100.0).abs() < 1e-12);
    }

    #[test]
    fn buy_is_clamped_to_available_cash() {
        let mut account = BrokerAccount::new(1_000.0, 0.001);
        let fill = account
            .buy(day(), "AAA", OrderSize::Notional(5_000.0), 10.0)
            .unwrap()
            .expect("buy should partially fill");
        let expected_notional = 1_000.0 / 1.001;
        assert!((fill.notional() - expected_notional).abs() < 1e-9);
        assert!(account.cash.cash().abs() < 1e-9);
        assert!(account.cash.cash() >= 0.0);

        let second = account
            .buy(day(), "AAA", OrderSize::Shares(1.0), 10.0)
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn sell_is_clamped_to_held_shares() {
        let mut account = BrokerAccount::new(1_000.0, 0.0);
        account
            .buy(day(), "AAA", OrderSize::Shares(10.0), 10.0)
            .unwrap();
        let fill = account
            .sell(day(), "AAA", 25.0, 12.0)
            .unwrap()
            .expect("sell should fill");
        assert!((fill.shares - 10.0).abs() < 1e-12);
        assert_eq!(account.positions.shares("AAA"), 0.0);
        assert!((account.cash.cash() - 1_020.0).abs() < 1e-9);

        assert!(account.sell(day(), "BBB", 1.0, 5.0).unwrap().is_none());
    }

    #[test]
    fn sell_proceeds_are_net_of_commission() {
        let mut account = BrokerAccount::new(0.0, 0.01);
        account.positions.add("AAA", 10.0);
        account.sell(day(), "AAA", 10.0, 100.0).unwrap();
        assert!((account.cash.cash() - 990.0).abs() < 1e-9);
    }

    #[test]
    fn zero_price_is_a_simulation_error() {
        let mut account = BrokerAccount::new(1_000.0, 0.0);
        let error = account
            .buy(day(), "AAA", OrderSize::Notional(100.0), 0.0)
            .unwrap_err();
        assert_eq!(
            error,
            BacktestError::simulation(day(), Some("AAA"), "cannot trade at price 0")
        );
    }

    #[test]
    fn broker_value_marks_positions_to_market() {
        let mut account = BrokerAccount::new(1_000.0, 0.0);
        account
            .buy(day(), "AAA", OrderSize::Shares(5.0), 100.0)
            .unwrap();
        account
            .buy(day(), "BBB", OrderSize::Shares(10.0), 20.0)
            .unwrap();
        let value = account.broker_value(|ticker| match ticker {
            "AAA" => 110.0,
            _ => 25.0,
        });
        assert!((value - (300.0 + 550.0 + 250.0)).abs() < 1e-9);
    }
}
