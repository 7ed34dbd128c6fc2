use crate::models::RebalanceFrequency;
use chrono::{Datelike, NaiveDate};
use std::collections::BTreeSet;

pub const DEFAULT_HORIZON_PERIODS: usize = 100;

/// Calendar dates on which a periodic event is due, starting from `start_date`.
///
/// Monthly schedules yield month-end dates, yearly schedules yield December 31st.
/// The first date is the first period end on or after `start_date`.
pub fn resolve(
    start_date: NaiveDate,
    frequency: RebalanceFrequency,
    horizon_periods: usize,
) -> BTreeSet<NaiveDate> {
    match frequency {
        RebalanceFrequency::Monthly => month_ends(start_date, horizon_periods),
        RebalanceFrequency::Yearly => year_ends(start_date, horizon_periods),
        RebalanceFrequency::None => BTreeSet::new(),
    }
}

fn month_ends(start_date: NaiveDate, periods: usize) -> BTreeSet<NaiveDate> {
    let mut dates = BTreeSet::new();
    let mut year = start_date.year();
    let mut month = start_date.month();
    while dates.len() < periods {
        let Some(end) = last_day_of_month(year, month) else {
            break;
        };
        dates.insert(end);
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
    dates
}

fn year_ends(start_date: NaiveDate, periods: usize) -> BTreeSet<NaiveDate> {
    (0..periods)
        .filter_map(|offset| i32::try_from(offset).ok())
        .filter_map(|offset| NaiveDate::from_ymd_opt(start_date.year() + offset, 12, 31))
        .collect()
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// Walks a resolved schedule alongside the simulated trading days.
///
/// A trigger is due on the first trading day on or after its calendar date and
/// fires exactly once.
#[derive(Debug, Clone)]
pub struct DueSchedule {
    dates: Vec<NaiveDate>,
    cursor: usize,
}

impl DueSchedule {
    pub fn new(dates: &BTreeSet<NaiveDate>) -> Self {
        Self {
            dates: dates.iter().copied().collect(),
            cursor: 0,
        }
    }

    pub fn resolve(
        start_date: NaiveDate,
        frequency: RebalanceFrequency,
        horizon_periods: usize,
    ) -> Self {
        Self::new(&resolve(start_date, frequency, horizon_periods))
    }

    /// Consumes every trigger dated on or before `trading_day` and returns how many fired.
    pub fn take_due(&mut self, trading_day: NaiveDate) -> usize {
        let mut fired = 0;
        while self.cursor < self.dates.len() && self.dates[self.cursor] <= trading_day {
            self.cursor += 1;
            fired += 1;
        }
        fired
    }

    pub fn remaining(&self) -> usize {
        self.dates.len() - self.cursor
    }
}
