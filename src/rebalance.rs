use crate::models::TradeSide;

/// Allowed deviation around a target value before a holding is traded back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceBands {
    pub abs_band_pct: f64,
    pub rel_band_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandThresholds {
    pub abs_min: f64,
    pub abs_max: f64,
    pub rel_min: f64,
    pub rel_max: f64,
}

impl BandThresholds {
    pub fn is_finite(&self) -> bool {
        self.abs_min.is_finite()
            && self.abs_max.is_finite()
            && self.rel_min.is_finite()
            && self.rel_max.is_finite()
    }

    /// True when `current_value` sits outside the absolute or the relative band.
    pub fn breached_by(&self, current_value: f64) -> bool {
        current_value < self.abs_min
            || current_value > self.abs_max
            || current_value < self.rel_min
            || current_value > self.rel_max
    }
}

impl RebalanceBands {
    pub fn thresholds(&self, target_value: f64) -> BandThresholds {
        BandThresholds {
            abs_min: target_value * (1.0 - self.abs_band_pct / 100.0),
            abs_max: target_value * (1.0 + self.abs_band_pct / 100.0),
            rel_min: target_value * (1.0 - self.rel_band_pct / 100.0),
            rel_max: target_value * (1.0 + self.rel_band_pct / 100.0),
        }
    }
}

/// A holding as seen on a rebalance day.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingView<'a> {
    pub ticker: &'a str,
    pub shares: f64,
    pub close: f64,
    pub target_weight_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceOrder {
    pub ticker: String,
    pub side: TradeSide,
    pub shares: f64,
    pub order_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceIssue {
    /// Band arithmetic produced a non-finite threshold.
    NonFiniteBand { ticker: String },
    /// Close price cannot size an order.
    InvalidPrice { ticker: String, price: f64 },
}

/// Orders that bring every holding outside its bands back to target.
///
/// Sells come first so that their proceeds fund the buys.
pub fn plan_rebalance(
    holdings: &[HoldingView<'_>],
    total_portfolio_value: f64,
    bands: RebalanceBands,
) -> Result<Vec<RebalanceOrder>, RebalanceIssue> {
    let mut sells = Vec::new();
    let mut buys = Vec::new();

    for holding in holdings {
        if !holding.close.is_finite() || holding.close <= 0.0 {
            return Err(RebalanceIssue::InvalidPrice {
                ticker: holding.ticker.to_string(),
                price: holding.close,
            });
        }
        let current_value = holding.shares * holding.close;
        let target_value = total_portfolio_value * (holding.target_weight_pct / 100.0);
        let thresholds = bands.thresholds(target_value);
        if !thresholds.is_finite() || !current_value.is_finite() {
            return Err(RebalanceIssue::NonFiniteBand {
                ticker: holding.ticker.to_string(),
            });
        }
        if !thresholds.breached_by(current_value) {
            continue;
        }

        let order_value = target_value - current_value;
        let shares = order_value.abs() / holding.close;
        if order_value > 0.0 {
            buys.push(RebalanceOrder {
                ticker: holding.ticker.to_string(),
                side: TradeSide::Buy,
                shares,
                order_value,
            });
        } else if order_value < 0.0 {
            sells.push(RebalanceOrder {
                ticker: holding.ticker.to_string(),
                side: TradeSide::Sell,
                shares,
                order_value,
            });
        }
    }

    sells.extend(buys);
    Ok(sells)
}
