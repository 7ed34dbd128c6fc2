use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::env;

const SETTINGS_ENV_PREFIX: &str = "BACKTEST_";

/// How per-ticker series with different trading calendars are merged into one day index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentPolicy {
    /// Only dates present in every ticker's series are simulated.
    #[default]
    Intersection,
    /// Union of dates once every ticker has started trading; gaps reuse the previous close.
    ForwardFill,
}

impl AlignmentPolicy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "intersection" | "inner" => Ok(Self::Intersection),
            "forward_fill" | "forward-fill" | "ffill" => Ok(Self::ForwardFill),
            other => Err(anyhow!(
                "ALIGNMENT_POLICY must be intersection or forward_fill (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Intersection => "intersection",
            Self::ForwardFill => "forward_fill",
        }
    }
}

/// Simulation configuration with named, validated fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub commission_rate: f64,
    pub abs_band_pct: f64,
    pub rel_band_pct: f64,
    pub inflation_rate: f64,
    pub inflation_base_year: i32,
    pub schedule_horizon_periods: usize,
    pub alignment: AlignmentPolicy,
    pub max_workers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            commission_rate: 0.001,
            abs_band_pct: 0.0,
            rel_band_pct: 0.0,
            inflation_rate: 0.03,
            inflation_base_year: 1970,
            schedule_horizon_periods: 100,
            alignment: AlignmentPolicy::Intersection,
            max_workers: std::cmp::max(1, num_cpus::get()),
        }
    }
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let commission_rate = optional_setting_f64(
            settings,
            "COMMISSION_RATE",
            defaults.commission_rate,
            Some(0.0),
            Some(0.999),
        )?;
        let abs_band_pct = optional_setting_f64(
            settings,
            "ABS_BAND_PCT",
            defaults.abs_band_pct,
            Some(0.0),
            Some(100.0),
        )?;
        let rel_band_pct = optional_setting_f64(
            settings,
            "REL_BAND_PCT",
            defaults.rel_band_pct,
            Some(0.0),
            Some(100.0),
        )?;
        let inflation_rate = optional_setting_f64(
            settings,
            "INFLATION_RATE",
            defaults.inflation_rate,
            Some(-0.99),
            Some(10.0),
        )?;
        let inflation_base_year = optional_setting_i32(
            settings,
            "INFLATION_BASE_YEAR",
            defaults.inflation_base_year,
            1,
        )?;
        let schedule_horizon_periods = optional_setting_usize(
            settings,
            "SCHEDULE_HORIZON_PERIODS",
            defaults.schedule_horizon_periods,
            1,
        )?;
        let alignment = match setting(settings, "ALIGNMENT_POLICY") {
            Some(raw) => AlignmentPolicy::parse(raw)?,
            None => defaults.alignment,
        };
        let max_workers =
            optional_setting_usize(settings, "MAX_WORKERS", defaults.max_workers, 1)?;

        Ok(Self {
            commission_rate,
            abs_band_pct,
            rel_band_pct,
            inflation_rate,
            inflation_base_year,
            schedule_horizon_periods,
            alignment,
            max_workers,
        })
    }

    /// Reads `BACKTEST_`-prefixed environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_settings_map(&settings_from_env())
    }

    /// Compounded factor discounting nominal amounts in `year` back to the base year.
    pub fn inflation_factor(&self, year: i32) -> f64 {
        (1.0 + self.inflation_rate).powi(year - self.inflation_base_year)
    }
}

/// Caller-side policy limits checked before any data is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_range_days: i64,
    pub max_portfolios: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_range_days: 365,
            max_portfolios: 10,
        }
    }
}

impl RequestLimits {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let max_range_days =
            optional_setting_i32(settings, "MAX_RANGE_DAYS", defaults.max_range_days as i32, 1)?
                as i64;
        let max_portfolios =
            optional_setting_usize(settings, "MAX_PORTFOLIOS", defaults.max_portfolios, 1)?;
        Ok(Self {
            max_range_days,
            max_portfolios,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_settings_map(&settings_from_env())
    }
}

pub fn settings_from_env() -> HashMap<String, String> {
    env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(SETTINGS_ENV_PREFIX)
                .map(|stripped| (stripped.to_string(), value))
        })
        .collect()
}

fn setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<usize>()
        .map_err(|_| anyhow!("Setting {} must be a non-negative integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn optional_setting_i32(
    settings: &HashMap<String, String>,
    key: &str,
    default: i32,
    min: i32,
) -> Result<i32> {
    let Some(raw) = setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<i32>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_map_yields_defaults() {
        let parsed = EngineSettings::from_settings_map(&HashMap::new()).unwrap();
        let defaults = EngineSettings::default();
        assert_eq!(parsed, defaults);
        assert!((parsed.commission_rate - 0.001).abs() < 1e-12);
        assert_eq!(parsed.schedule_horizon_periods, 100);
    }

    #[test]
    fn parses_and_validates_ranges() {
        let parsed = EngineSettings::from_settings_map(&settings(&[
            ("COMMISSION_RATE", "0.0"),
            ("ABS_BAND_PCT", "5"),
            ("REL_BAND_PCT", " 25 "),
            ("ALIGNMENT_POLICY", "ffill"),
            ("MAX_WORKERS", "2"),
        ]))
        .unwrap();
        assert_eq!(parsed.commission_rate, 0.0);
        assert_eq!(parsed.abs_band_pct, 5.0);
        assert_eq!(parsed.rel_band_pct, 25.0);
        assert_eq!(parsed.alignment, AlignmentPolicy::ForwardFill);
        assert_eq!(parsed.max_workers, 2);

        assert!(EngineSettings::from_settings_map(&settings(&[("ABS_BAND_PCT", "-1")])).is_err());
        assert!(
            EngineSettings::from_settings_map(&settings(&[("COMMISSION_RATE", "abc")])).is_err()
        );
        assert!(
            EngineSettings::from_settings_map(&settings(&[("SCHEDULE_HORIZON_PERIODS", "0")]))
                .is_err()
        );
        assert!(
            EngineSettings::from_settings_map(&settings(&[("ALIGNMENT_POLICY", "outer")])).is_err()
        );
    }

    #[test]
    fn inflation_factor_compounds_from_base_year() {
        let settings = EngineSettings::default();
        assert!((settings.inflation_factor(1970) - 1.0).abs() < 1e-12);
        let expected = 1.03_f64.powi(30);
        assert!((settings.inflation_factor(2000) - expected).abs() < 1e-9);
    }

    #[test]
    fn request_limits_read_overrides() {
        let limits = RequestLimits::from_settings_map(&settings(&[("MAX_PORTFOLIOS", "3")]))
            .unwrap();
        assert_eq!(limits.max_portfolios, 3);
        assert_eq!(limits.max_range_days, 365);
    }
}
