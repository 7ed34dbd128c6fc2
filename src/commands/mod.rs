pub mod backtest;
pub mod export_market_data;
