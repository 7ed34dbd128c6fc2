use anyhow::Result;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
use portfolio_backtest::backtester::Backtester;
use portfolio_backtest::commands::export_market_data;
use portfolio_backtest::config::{EngineSettings, RequestLimits};
use portfolio_backtest::error::BacktestError;
use portfolio_backtest::http_client::HttpClientOptions;
use portfolio_backtest::market_data::MarketData;
use portfolio_backtest::models::{
    BacktestRequest, PortfolioItem, PortfolioOutcome, PriceBar, RebalanceFrequency,
};
use portfolio_backtest::provider::{HttpPriceProvider, PriceDataProvider, SnapshotProvider};
use portfolio_backtest::retry::RetryPolicy;
use portfolio_backtest::status::BatchPhase;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufRead, BufReader, Write as IoWrite};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

fn weekday_bars(start: NaiveDate, end: NaiveDate, base: f64, step: f64) -> Vec<PriceBar> {
    let mut bars = Vec::new();
    let mut current = start;
    let mut price = base;
    while current <= end {
        if !matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
            bars.push(PriceBar::flat(current, price));
            price += step;
        }
        current += ChronoDuration::days(1);
    }
    bars
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    }
}

struct PriceStubData {
    series: HashMap<String, String>,
    throttle_once: Mutex<HashSet<String>>,
    requests: AtomicUsize,
}

struct PriceStub {
    base_url: String,
    data: Arc<PriceStubData>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PriceStub {
    fn start(series: BTreeMap<String, Vec<PriceBar>>, throttle_once: &[&str]) -> Result<Self> {
        let mut listener: Option<TcpListener> = None;
        for _ in 0..64 {
            let port = fastrand::u16(40_000..60_000);
            if let Ok(bound) = TcpListener::bind(("127.0.0.1", port)) {
                listener = Some(bound);
                break;
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind("127.0.0.1:0")?,
        };
        listener.set_nonblocking(true)?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let (shutdown, shutdown_rx) = mpsc::channel();

        let mut encoded = HashMap::new();
        for (ticker, bars) in series {
            encoded.insert(ticker, serde_json::to_string(&bars)?);
        }
        let data = Arc::new(PriceStubData {
            series: encoded,
            throttle_once: Mutex::new(throttle_once.iter().map(|t| t.to_string()).collect()),
            requests: AtomicUsize::new(0),
        });
        let shared = Arc::clone(&data);

        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = handle_price_request(stream, &shared);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    thread::sleep(Duration::from_millis(5));
                }
            }
        });

        Ok(Self {
            base_url,
            data,
            shutdown,
            handle: Some(handle),
        })
    }

    fn request_count(&self) -> usize {
        self.data.requests.load(Ordering::SeqCst)
    }

    fn provider(&self) -> HttpPriceProvider {
        HttpPriceProvider::new(&self.base_url, &HttpClientOptions::default())
            .unwrap()
            .with_retry_policy(fast_retries())
    }
}

impl Drop for PriceStub {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_price_request(
    mut stream: std::net::TcpStream,
    data: &PriceStubData,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(());
    }
    let raw_path = parts[1];
    let mut path_only = raw_path.split('?').next().unwrap_or(raw_path);
    if let Some(stripped) = path_only
        .strip_prefix("http://")
        .or_else(|| path_only.strip_prefix("https://"))
    {
        path_only = stripped.find('/').map(|idx| &stripped[idx..]).unwrap_or("/");
    }

    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" {
            break;
        }
    }

    data.requests.fetch_add(1, Ordering::SeqCst);
    let Some(ticker) = path_only.strip_prefix("/prices/") else {
        return write_json_response(&mut stream, "404 Not Found", "{}");
    };
    let throttled = data
        .throttle_once
        .lock()
        .map(|mut pending| pending.remove(ticker))
        .unwrap_or(false);
    if throttled {
        return write_json_response(
            &mut stream,
            "429 Too Many Requests",
            r#"{"error":"slow down"}"#,
        );
    }
    match data.series.get(ticker) {
        Some(body) => write_json_response(&mut stream, "200 OK", body),
        None => write_json_response(&mut stream, "404 Not Found", r#"{"error":"unknown"}"#),
    }
}

fn write_json_response(
    stream: &mut std::net::TcpStream,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

fn item(name: &str, allocation: &[(&str, f64)]) -> PortfolioItem {
    PortfolioItem {
        name: name.to_string(),
        allocation: allocation
            .iter()
            .map(|(ticker, weight)| (ticker.to_string(), *weight))
            .collect(),
        drag: 0.0,
        invest_dividends: true,
        rebalance_freq: RebalanceFrequency::Monthly,
    }
}

fn stub_series() -> BTreeMap<String, Vec<PriceBar>> {
    let (start, end) = (date(2022, 12, 1), date(2024, 1, 31));
    let mut series = BTreeMap::new();
    series.insert("AAA".to_string(), weekday_bars(start, end, 100.0, 0.125));
    series.insert("BBB".to_string(), weekday_bars(start, end, 40.0, -0.015625));
    series
}

#[tokio::test]
async fn http_provider_retries_after_rate_limit() -> Result<()> {
    ensure_test_env();
    let stub = PriceStub::start(stub_series(), &["AAA"])?;
    let provider = stub.provider();

    let bars = provider
        .fetch_series(" aaa ", date(2023, 1, 2), date(2023, 1, 31))
        .await?;

    assert_eq!(stub.request_count(), 2);
    assert_eq!(bars.first().map(|bar| bar.date), Some(date(2023, 1, 2)));
    assert_eq!(bars.last().map(|bar| bar.date), Some(date(2023, 1, 31)));
    assert!(bars.windows(2).all(|pair| pair[0].date < pair[1].date));
    Ok(())
}

#[tokio::test]
async fn http_provider_without_retries_surfaces_rate_limit() -> Result<()> {
    ensure_test_env();
    let stub = PriceStub::start(stub_series(), &["BBB"])?;
    let provider = stub.provider().with_retry_policy(RetryPolicy::no_retries());

    let err = provider
        .fetch_series("BBB", date(2023, 1, 2), date(2023, 1, 31))
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(stub.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn http_provider_maps_unknown_ticker_and_empty_range() -> Result<()> {
    ensure_test_env();
    let stub = PriceStub::start(stub_series(), &[])?;
    let provider = stub.provider();

    let unknown = provider
        .fetch_series("ZZZ", date(2023, 1, 2), date(2023, 1, 31))
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), "data_unavailable");

    let empty = provider
        .fetch_series("AAA", date(2019, 1, 1), date(2019, 12, 31))
        .await
        .unwrap_err();
    assert!(matches!(empty, BacktestError::DataUnavailable { .. }));
    Ok(())
}

#[tokio::test]
async fn backtester_reports_each_portfolio_in_request_order() -> Result<()> {
    ensure_test_env();
    let stub = PriceStub::start(stub_series(), &["AAA"])?;
    let provider = stub.provider();
    let request = BacktestRequest {
        start_date: date(2023, 1, 1),
        end_date: date(2023, 12, 31),
        initial_capital: 10_000.0,
        cashflow: 500.0,
        cashflow_freq: RebalanceFrequency::Monthly,
        adjust_inflation: false,
        portfolio: vec![
            item("Balanced", &[("aaa", 60.0), ("BBB", 40.0)]),
            item("Ghost", &[("AAA", 50.0), ("MISSING", 50.0)]),
            item("Solo", &[("BBB", 100.0)]),
        ],
    };

    let backtester = Backtester::new(EngineSettings::default(), RequestLimits::default());
    let status = backtester.status();
    let report = backtester.run(&request, &provider).await?;

    let names: Vec<&str> = report.portfolios.iter().map(|outcome| outcome.name()).collect();
    assert_eq!(names, vec!["Balanced", "Ghost", "Solo"]);
    assert_eq!(report.failed_count(), 1);

    match &report.portfolios[1] {
        PortfolioOutcome::Failed { error_kind, .. } => assert_eq!(error_kind, "data_unavailable"),
        other => panic!("expected failure, got {:?}", other),
    }
    let balanced = report.portfolios[0].series().expect("balanced completes");
    assert_eq!(balanced.date.len(), balanced.performance.len());
    assert!(balanced.positions.contains_key("AAA"));
    assert_eq!(balanced.annual_returns.len(), 1);
    assert_eq!(balanced.annual_returns[0].year, 2023);

    let snapshot = status.snapshot();
    assert_eq!(snapshot.phase, BatchPhase::Finished);
    assert_eq!(snapshot.total_portfolios, 3);
    assert_eq!(snapshot.completed_portfolios, 2);
    assert_eq!(snapshot.failed_portfolios, 1);
    Ok(())
}

#[tokio::test]
async fn snapshot_and_http_sources_agree() -> Result<()> {
    ensure_test_env();
    let stub = PriceStub::start(stub_series(), &[])?;
    let provider = stub.provider();
    let (start, end) = (date(2023, 1, 1), date(2023, 6, 30));

    let tickers = vec!["aaa".to_string(), "BBB".to_string(), "AAA ".to_string()];
    let snapshot = export_market_data::collect(&provider, &tickers, start, end).await?;
    assert_eq!(snapshot.tickers(), vec!["AAA".to_string(), "BBB".to_string()]);

    let dir = std::env::temp_dir().join(format!("portfolio-backtest-{}", fastrand::u64(..)));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("market-data.bin");
    snapshot.save_to_file(&path)?;
    let reloaded = MarketData::load_from_file(&path)?;
    let _ = std::fs::remove_dir_all(&dir);
    assert_eq!(reloaded.bar_count(), snapshot.bar_count());

    let request = BacktestRequest {
        start_date: start,
        end_date: end,
        initial_capital: 25_000.0,
        cashflow: 0.0,
        cashflow_freq: RebalanceFrequency::None,
        adjust_inflation: false,
        portfolio: vec![item("Mix", &[("AAA", 30.0), ("BBB", 70.0)])],
    };
    let backtester = Backtester::new(EngineSettings::default(), RequestLimits::default());
    let from_http = backtester.run(&request, &provider).await?;
    let from_snapshot = backtester
        .run(&request, &SnapshotProvider::new(reloaded))
        .await?;
    assert_eq!(from_http.portfolios, from_snapshot.portfolios);
    Ok(())
}

#[tokio::test]
async fn export_rejects_inverted_range() {
    ensure_test_env();
    let provider = SnapshotProvider::new(MarketData::default());
    let err = export_market_data::collect(
        &provider,
        &["AAA".to_string()],
        date(2023, 2, 1),
        date(2023, 1, 1),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("after"));
}

#[tokio::test]
async fn invalid_request_fails_before_fetching() -> Result<()> {
    ensure_test_env();
    let stub = PriceStub::start(stub_series(), &[])?;
    let provider = stub.provider();
    let request = BacktestRequest {
        start_date: date(2022, 12, 1),
        end_date: date(2024, 1, 31),
        initial_capital: 10_000.0,
        cashflow: 0.0,
        cashflow_freq: RebalanceFrequency::None,
        adjust_inflation: false,
        portfolio: vec![item("Too long", &[("AAA", 100.0)])],
    };

    let backtester = Backtester::new(EngineSettings::default(), RequestLimits::default());
    let err = backtester.run(&request, &provider).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_parameters");
    assert_eq!(stub.request_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn simulation_leaves_the_runtime_free_for_other_tasks() -> Result<()> {
    ensure_test_env();
    let (start, end) = (date(2023, 1, 1), date(2023, 12, 31));
    let mut series = stub_series();
    for ticker in ["CCC", "DDD", "EEE", "FFF"] {
        series.insert(ticker.to_string(), weekday_bars(start, end, 25.0, 0.0625));
    }
    let provider = SnapshotProvider::new(MarketData::from_series(series));
    let portfolio = (0..10)
        .map(|index| {
            item(
                &format!("Mix {}", index),
                &[
                    ("AAA", 20.0),
                    ("BBB", 20.0),
                    ("CCC", 20.0),
                    ("DDD", 20.0),
                    ("EEE", 10.0),
                    ("FFF", 10.0),
                ],
            )
        })
        .collect();
    let request = BacktestRequest {
        start_date: start,
        end_date: end,
        initial_capital: 50_000.0,
        cashflow: 250.0,
        cashflow_freq: RebalanceFrequency::Monthly,
        adjust_inflation: true,
        portfolio,
    };

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker_task = {
        let ticks = Arc::clone(&ticks);
        tokio::spawn(async move {
            ticks.fetch_add(1, Ordering::SeqCst);
        })
    };

    let backtester = Backtester::new(EngineSettings::default(), RequestLimits::default());
    let report = backtester.run(&request, &provider).await?;
    // The spawned task can only have run if `run` yielded while portfolios simulated.
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
    ticker_task.await?;

    assert_eq!(report.portfolios.len(), 10);
    assert_eq!(report.failed_count(), 0);
    Ok(())
}
