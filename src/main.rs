use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::warn;
use portfolio_backtest::commands::{
    backtest::{self, PriceSource},
    export_market_data,
};
use portfolio_backtest::engine::CancellationToken;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "market-data.bin";

#[derive(Parser)]
#[command(name = "portfolio-backtest")]
#[command(about = "Day-by-day portfolio backtests with rebalancing, cashflows and dividends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest request and print or save the JSON report
    Backtest {
        /// JSON request with dates, capital, cashflow and portfolios
        #[arg(long, value_name = "PATH")]
        request: PathBuf,
        /// Path to the market data snapshot file
        #[arg(
            long = "data-file",
            value_name = "PATH",
            conflicts_with = "provider_url",
            required_unless_present = "provider_url"
        )]
        data_file: Option<PathBuf>,
        /// Base URL of the price provider
        #[arg(long = "provider-url", value_name = "URL")]
        provider_url: Option<String>,
        /// Destination file for the report (stdout when omitted)
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Export market data snapshot for offline backtests
    ExportMarketData {
        /// Comma separated list of tickers
        #[arg(long, value_delimiter = ',', num_args = 1.., required = true)]
        tickers: Vec<String>,
        /// First date to fetch (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last date to fetch (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,
        /// Base URL of the price provider
        #[arg(long = "provider-url", value_name = "URL")]
        provider_url: String,
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match command {
        Commands::Backtest {
            request,
            data_file,
            provider_url,
            output,
        } => {
            let source = match (data_file, provider_url) {
                (Some(path), _) => PriceSource::Snapshot(path),
                (None, Some(url)) => PriceSource::Provider(url),
                (None, None) => PriceSource::Snapshot(PathBuf::from(DEFAULT_MARKET_DATA_FILE)),
            };
            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());
            backtest::run(&request, source, output.as_deref(), cancel).await?;
        }
        Commands::ExportMarketData {
            tickers,
            start,
            end,
            provider_url,
            output,
        } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            export_market_data::run(&tickers, start, end, &provider_url, &output_path).await?;
        }
    }

    Ok(())
}

fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling remaining portfolio runs");
            cancel.cancel();
        }
    });
}
