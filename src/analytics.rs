use crate::models::{AnnualReturn, PerformanceSummary, ValueSample};
use chrono::{Datelike, NaiveDate};
use statrs::statistics::Statistics;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const RISK_FREE_RATE: f64 = 0.02;
const DAYS_PER_YEAR: f64 = 365.25;

/// Percent change from the first to the last value of each calendar year.
///
/// Years appear in the order of their first sample. A year holding a single sample
/// is measured against the previous year's last value; with no previous year it
/// reports 0. A non-positive base also reports 0.
pub fn calculate_annual_returns(samples: &[ValueSample]) -> Vec<AnnualReturn> {
    struct YearSpan {
        year: i32,
        first: f64,
        last: f64,
        count: usize,
    }

    let mut spans: Vec<YearSpan> = Vec::new();
    for sample in samples {
        let year = sample.date.year();
        match spans.iter_mut().find(|span| span.year == year) {
            Some(span) => {
                span.last = sample.portfolio_value;
                span.count += 1;
            }
            None => spans.push(YearSpan {
                year,
                first: sample.portfolio_value,
                last: sample.portfolio_value,
                count: 1,
            }),
        }
    }

    let mut previous_close: Option<f64> = None;
    spans
        .into_iter()
        .map(|span| {
            let base = if span.count > 1 {
                Some(span.first)
            } else {
                previous_close
            };
            previous_close = Some(span.last);
            let return_percent = match base {
                Some(base) if base > 0.0 && span.last.is_finite() => {
                    (span.last / base - 1.0) * 100.0
                }
                _ => 0.0,
            };
            AnnualReturn {
                year: span.year,
                return_percent,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawdownInfo {
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub longest_drawdown_days: i64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn summarize(samples: &[ValueSample]) -> PerformanceSummary {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return PerformanceSummary {
                total_return_percent: 0.0,
                cagr: 0.0,
                max_drawdown_percent: 0.0,
                longest_drawdown_days: 0,
                volatility: 0.0,
                sharpe_ratio: 0.0,
                calmar_ratio: 0.0,
            };
        };

        let total_return_percent = if first.portfolio_value > 0.0 && last.portfolio_value.is_finite()
        {
            (last.portfolio_value / first.portfolio_value - 1.0) * 100.0
        } else {
            0.0
        };
        let cagr = Self::calculate_cagr(
            first.portfolio_value,
            last.portfolio_value,
            first.date,
            last.date,
        );
        let drawdown_info = Self::calculate_max_drawdown(samples);
        let calmar_ratio = Self::calculate_calmar_ratio(cagr, drawdown_info.max_drawdown_percent);

        PerformanceSummary {
            total_return_percent,
            cagr,
            max_drawdown_percent: drawdown_info.max_drawdown_percent,
            longest_drawdown_days: drawdown_info.longest_drawdown_days,
            volatility: Self::calculate_volatility(samples),
            sharpe_ratio: Self::calculate_sharpe_ratio(samples),
            calmar_ratio,
        }
    }

    fn calculate_cagr(
        start_value: f64,
        end_value: f64,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> f64 {
        if start_value <= 0.0 || !end_value.is_finite() || end_date <= start_date {
            return 0.0;
        }

        let years = (end_date - start_date).num_days() as f64 / DAYS_PER_YEAR;
        let total_return_ratio = end_value / start_value;
        if total_return_ratio <= 0.0 {
            return -1.0;
        }

        total_return_ratio.powf(1.0 / years) - 1.0
    }

    fn daily_returns(samples: &[ValueSample]) -> Vec<f64> {
        samples
            .windows(2)
            .map(|window| {
                let prev_value = window[0].portfolio_value;
                let curr_value = window[1].portfolio_value;
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Annualized standard deviation of daily returns.
    pub fn calculate_volatility(samples: &[ValueSample]) -> f64 {
        let returns = Self::daily_returns(samples);
        if returns.len() < 2 {
            return 0.0;
        }
        let std_dev = returns.std_dev();
        if !std_dev.is_finite() {
            return 0.0;
        }
        std_dev * TRADING_DAYS_PER_YEAR.sqrt()
    }

    pub fn calculate_sharpe_ratio(samples: &[ValueSample]) -> f64 {
        let returns = Self::daily_returns(samples);
        if returns.len() < 2 {
            return 0.0;
        }

        let mean_return = returns.clone().mean();
        let std_dev = returns.std_dev();
        if !std_dev.is_finite() || std_dev == 0.0 {
            return 0.0;
        }

        let annualized_return = mean_return * TRADING_DAYS_PER_YEAR;
        let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();

        (annualized_return - RISK_FREE_RATE) / annualized_volatility
    }

    fn calculate_calmar_ratio(cagr: f64, max_drawdown_percent: f64) -> f64 {
        if !cagr.is_finite() || !max_drawdown_percent.is_finite() {
            return 0.0;
        }

        let drawdown_ratio = (max_drawdown_percent / 100.0).abs();
        if drawdown_ratio <= f64::EPSILON {
            return 0.0;
        }

        cagr / drawdown_ratio
    }

    /// Deepest peak-to-trough decline and the longest time spent below a peak.
    ///
    /// An unrecovered drawdown is measured up to the last sample.
    pub fn calculate_max_drawdown(samples: &[ValueSample]) -> DrawdownInfo {
        let Some(first) = samples.first() else {
            return DrawdownInfo {
                max_drawdown: 0.0,
                max_drawdown_percent: 0.0,
                longest_drawdown_days: 0,
            };
        };

        let mut max_drawdown = 0.0;
        let mut max_drawdown_percent = 0.0;
        let mut longest_drawdown_days = 0;
        let mut peak_value = first.portfolio_value;
        let mut peak_date = first.date;

        for sample in samples {
            if sample.portfolio_value >= peak_value {
                peak_value = sample.portfolio_value;
                peak_date = sample.date;
                continue;
            }

            let drawdown = peak_value - sample.portfolio_value;
            let drawdown_percent = if peak_value > 0.0 {
                (drawdown / peak_value) * 100.0
            } else {
                0.0
            };
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
            if drawdown_percent > max_drawdown_percent {
                max_drawdown_percent = drawdown_percent;
            }
            longest_drawdown_days = longest_drawdown_days.max((sample.date - peak_date).num_days());
        }

        DrawdownInfo {
            max_drawdown,
            max_drawdown_percent,
            longest_drawdown_days,
        }
    }
}
