pub mod analytics;
pub mod backtester;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod ledger;
pub mod market_data;
pub mod models;
pub mod provider;
pub mod rebalance;
pub mod retry;
pub mod schedule;
pub mod status;
