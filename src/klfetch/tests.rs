//! 采集流程测试
//!
//! 测试目标：
//! 1. 品种缓存的命中、过期刷新与失败回退
//! 2. 并发上限与单品种失败隔离
//! 3. 完整一轮采集后每个品种只保留最近 N 根K线

use crate::klcommon::{
    AppError, Candle, ExchangeClient, FetcherConfig, OhlcvRepository, Result, TickerSnapshot, Timeframe,
};
use crate::klfetch::{FetchCoordinator, Orchestrator, SymbolSelector};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 可编程的行情源
#[derive(Default)]
struct MockExchange {
    /// `None` 表示请求失败
    tickers: Mutex<Option<Vec<TickerSnapshot>>>,
    tradable: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    /// 这些周期返回 close 为 NaN 的K线，写入时会违反 NOT NULL 约束
    unstorable: Mutex<HashSet<Timeframe>>,
    /// 最新一根K线的开盘时间
    latest_open_time: AtomicI64,
    fetch_delay: Mutex<Duration>,
    ticker_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockExchange {
    fn with_turnovers(pairs: &[(&str, f64)]) -> Self {
        let mock = Self::default();
        mock.set_tickers(pairs);
        mock
    }

    fn set_tickers(&self, pairs: &[(&str, f64)]) {
        let tickers = pairs
            .iter()
            .map(|(symbol, turnover)| TickerSnapshot {
                symbol: symbol.to_string(),
                turnover_24h: *turnover,
                price_change_pct_24h: Some(0.01),
            })
            .collect();
        *self.tickers.lock().unwrap() = Some(tickers);
    }

    fn fail_tickers(&self) {
        *self.tickers.lock().unwrap() = None;
    }

    fn fail_symbol(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    fn hang_symbol(&self, symbol: &str) {
        self.hanging.lock().unwrap().insert(symbol.to_string());
    }

    fn make_unstorable(&self, timeframe: Timeframe) {
        self.unstorable.lock().unwrap().insert(timeframe);
    }

    fn set_tradable(&self, symbols: &[&str]) {
        *self.tradable.lock().unwrap() = symbols.iter().map(|s| s.to_string()).collect();
    }

    fn set_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }
}

/// 在途计数，Drop 时减一（超时被取消的请求也能正确计数）
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn list_tradable_instruments(&self) -> Result<Vec<String>> {
        Ok(self.tradable.lock().unwrap().clone())
    }

    async fn snapshot_tickers(&self) -> Result<Vec<TickerSnapshot>> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        let tickers = self.tickers.lock().unwrap().clone();
        tickers.ok_or_else(|| AppError::ApiError("mock ticker failure".to_string()))
    }

    async fn fetch_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Option<Vec<Candle>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let hanging = self.hanging.lock().unwrap().contains(symbol);
        if hanging {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.lock().unwrap().contains(symbol) {
            return None;
        }

        let close = if self.unstorable.lock().unwrap().contains(&timeframe) { f64::NAN } else { 1.5 };
        let latest = self.latest_open_time.load(Ordering::SeqCst);
        let step = timeframe.duration_ms();
        Some(
            (0..limit as i64)
                .map(|i| {
                    let open_time = latest - i * step;
                    Candle {
                        symbol: symbol.to_string(),
                        open_time,
                        open: 1.0,
                        high: 2.0,
                        low: 0.5,
                        close,
                        volume: 10.0,
                        turnover: Some(15.0),
                    }
                })
                .collect(),
        )
    }
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// SymbolSelector
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_selector_uses_cache_within_ttl() {
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 1.0), ("BUSDT", 2.0)]));
    let selector = SymbolSelector::new(mock.clone(), 30, ChronoDuration::hours(24));

    let first = selector.ensure_fresh(t0()).await.unwrap();
    let second = selector.ensure_fresh(t0() + ChronoDuration::hours(23)).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(mock.ticker_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_selector_refreshes_after_ttl() {
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 1.0), ("BUSDT", 2.0)]));
    let selector = SymbolSelector::new(mock.clone(), 1, ChronoDuration::hours(24));

    let first = selector.ensure_fresh(t0()).await.unwrap();
    assert_eq!(first.symbols, symbols(&["BUSDT"]));

    mock.set_tickers(&[("AUSDT", 5.0), ("BUSDT", 2.0)]);
    let later = t0() + ChronoDuration::hours(24);
    let second = selector.ensure_fresh(later).await.unwrap();

    assert_eq!(second.symbols, symbols(&["AUSDT"]));
    assert_eq!(second.selected_at, later);
    assert_eq!(mock.ticker_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_selector_keeps_stale_set_when_refresh_fails() {
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 1.0)]));
    let selector = SymbolSelector::new(mock.clone(), 30, ChronoDuration::hours(24));
    let original = selector.ensure_fresh(t0()).await.unwrap();

    // 上游返回空列表
    mock.set_tickers(&[]);
    let stale = selector.ensure_fresh(t0() + ChronoDuration::hours(25)).await.unwrap();
    assert_eq!(stale.symbols, original.symbols);
    assert_eq!(stale.selected_at, t0());

    // 上游请求失败
    mock.fail_tickers();
    let stale = selector.ensure_fresh(t0() + ChronoDuration::hours(26)).await.unwrap();
    assert_eq!(stale.symbols, original.symbols);
}

#[tokio::test]
async fn test_forced_refresh_keeps_fresh_set_on_failure() {
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 2.0), ("BUSDT", 1.0)]));
    let selector = SymbolSelector::new(mock.clone(), 30, ChronoDuration::hours(24));
    let original = selector.ensure_fresh(t0()).await.unwrap();

    // 缓存未过期，强制刷新时上游返回空列表
    mock.set_tickers(&[]);
    let kept = selector.refresh(t0() + ChronoDuration::hours(1)).await.unwrap();
    assert!(Arc::ptr_eq(&kept, &original));
    assert_eq!(kept.selected_at, t0());

    // 强制刷新时上游请求失败
    mock.fail_tickers();
    let kept = selector.refresh(t0() + ChronoDuration::hours(2)).await.unwrap();
    assert!(Arc::ptr_eq(&kept, &original));
    assert_eq!(kept.selected_at, t0());

    let current = selector.current().await.unwrap();
    assert!(Arc::ptr_eq(&current, &original));
}

#[tokio::test]
async fn test_refresh_keeps_stale_set_when_nothing_is_tradable() {
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 2.0), ("BUSDT", 1.0)]));
    let selector = SymbolSelector::new(mock.clone(), 30, ChronoDuration::hours(24));
    let original = selector.ensure_fresh(t0()).await.unwrap();

    // ticker 非空，但全部不在可交易列表中
    mock.set_tradable(&["ZZZUSDT"]);
    let kept = selector.refresh(t0() + ChronoDuration::hours(1)).await.unwrap();
    assert!(Arc::ptr_eq(&kept, &original));
    assert_eq!(kept.symbols, symbols(&["AUSDT", "BUSDT"]));

    // 没有旧集合时同样的情况是选择失败
    let fresh_selector = SymbolSelector::new(mock, 30, ChronoDuration::hours(24));
    let err = fresh_selector.ensure_fresh(t0()).await.unwrap_err();
    assert!(matches!(err, AppError::SelectionExhausted(_)));
}

#[tokio::test]
async fn test_selector_exhausted_without_previous_set() {
    let mock = Arc::new(MockExchange::with_turnovers(&[]));
    let selector = SymbolSelector::new(mock.clone(), 30, ChronoDuration::hours(24));

    let err = selector.ensure_fresh(t0()).await.unwrap_err();
    assert!(matches!(err, AppError::SelectionExhausted(_)));
    assert!(selector.current().await.is_none());

    mock.fail_tickers();
    let err = selector.ensure_fresh(t0()).await.unwrap_err();
    assert!(matches!(err, AppError::SelectionExhausted(_)));
}

#[tokio::test]
async fn test_selector_ranking_is_stable_and_bounded() {
    let mock = Arc::new(MockExchange::with_turnovers(&[
        ("AUSDT", 10.0),
        ("BUSDT", 30.0),
        ("CUSDT", 10.0),
        ("DUSDT", 20.0),
        ("EUSDT", 10.0),
    ]));
    let selector = SymbolSelector::new(mock, 4, ChronoDuration::hours(24));

    let set = selector.ensure_fresh(t0()).await.unwrap();
    assert_eq!(set.symbols, symbols(&["BUSDT", "DUSDT", "AUSDT", "CUSDT"]));
}

#[tokio::test]
async fn test_selector_filters_non_tradable_symbols() {
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 3.0), ("BUSDT", 2.0), ("CUSDT", 1.0)]));
    mock.set_tradable(&["BUSDT", "CUSDT"]);
    let selector = SymbolSelector::new(mock.clone(), 30, ChronoDuration::hours(24));

    let set = selector.refresh(t0()).await.unwrap();
    assert_eq!(set.symbols, symbols(&["BUSDT", "CUSDT"]));

    // 可交易列表为空时视为未知，不过滤
    mock.set_tradable(&[]);
    let set = selector.refresh(t0()).await.unwrap();
    assert_eq!(set.symbols, symbols(&["AUSDT", "BUSDT", "CUSDT"]));
}

// ---------------------------------------------------------------------------
// FetchCoordinator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_coordinator_respects_concurrency_limit() {
    let mock = Arc::new(MockExchange::default());
    mock.set_delay(Duration::from_millis(20));
    let coordinator = FetchCoordinator::new(mock.clone(), 3, Duration::from_secs(5));

    let instruments: Vec<String> = (0..12).map(|i| format!("S{}USDT", i)).collect();
    let results = coordinator.fetch_timeframe(&instruments, Timeframe::M1, 5).await;

    assert_eq!(results.len(), instruments.len());
    assert!(results.iter().all(|r| r.is_success()));
    let order: Vec<String> = results.iter().map(|r| r.symbol.clone()).collect();
    assert_eq!(order, instruments);

    assert_eq!(mock.fetch_calls.load(Ordering::SeqCst), 12);
    let max = mock.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "max in flight was {}", max);
    assert!(max >= 2, "requests never overlapped");
}

#[tokio::test]
async fn test_coordinator_isolates_failures_and_timeouts() {
    let mock = Arc::new(MockExchange::default());
    mock.fail_symbol("BADUSDT");
    mock.hang_symbol("SLOWUSDT");
    let coordinator = FetchCoordinator::new(mock.clone(), 2, Duration::from_millis(100));

    let instruments = symbols(&["AUSDT", "BADUSDT", "SLOWUSDT", "BUSDT"]);
    let results = coordinator.fetch_timeframe(&instruments, Timeframe::H1, 3).await;

    let outcome: HashMap<&str, bool> = results.iter().map(|r| (r.symbol.as_str(), r.is_success())).collect();
    assert_eq!(outcome["AUSDT"], true);
    assert_eq!(outcome["BADUSDT"], false);
    assert_eq!(outcome["SLOWUSDT"], false);
    assert_eq!(outcome["BUSDT"], true);
    assert_eq!(results[0].candles.as_ref().map(Vec::len), Some(3));
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

fn test_config(timeframes: Vec<Timeframe>) -> FetcherConfig {
    FetcherConfig {
        timeframes,
        concurrency_limit: 4,
        ohlcv_history_limit: 5,
        top_symbols_count: 3,
        ..FetcherConfig::default()
    }
}

fn open_repo() -> (tempfile::TempDir, OhlcvRepository) {
    let dir = tempfile::tempdir().unwrap();
    let repo = OhlcvRepository::new(dir.path().join("cycle.db")).unwrap();
    (dir, repo)
}

#[tokio::test]
async fn test_full_cycle_stores_bounded_window() {
    let (_dir, repo) = open_repo();
    let mock = Arc::new(MockExchange::with_turnovers(&[
        ("AUSDT", 4.0),
        ("BUSDT", 3.0),
        ("CUSDT", 2.0),
        ("DUSDT", 1.0),
    ]));
    mock.latest_open_time.store(10 * Timeframe::D1.duration_ms(), Ordering::SeqCst);

    let orchestrator = Orchestrator::new(test_config(vec![Timeframe::H1, Timeframe::D1]), mock, repo.clone());
    let report = orchestrator.run_cycle(t0()).await.unwrap();

    assert_eq!(report.target_count, 3);
    assert_eq!(report.timeframes.len(), 2);
    assert_eq!(report.timeframes[0].timeframe, Timeframe::H1);
    assert_eq!(report.fetch_failures(), 0);
    assert_eq!(report.storage_failures(), 0);

    for timeframe in [Timeframe::H1, Timeframe::D1] {
        for symbol in ["AUSDT", "BUSDT", "CUSDT"] {
            assert_eq!(repo.count_rows(timeframe, symbol).unwrap(), 5);
        }
        assert_eq!(repo.count_rows(timeframe, "DUSDT").unwrap(), 0);
    }
    assert_eq!(orchestrator.stats().completed, 1);
    assert_eq!(orchestrator.stats().failed, 0);
}

#[tokio::test]
async fn test_failed_selection_aborts_cycle() {
    let (_dir, repo) = open_repo();
    let mock = Arc::new(MockExchange::with_turnovers(&[]));

    let orchestrator = Orchestrator::new(test_config(vec![Timeframe::M1]), mock.clone(), repo);
    let err = orchestrator.run_cycle(t0()).await.unwrap_err();

    assert!(matches!(err, AppError::SelectionExhausted(_)));
    assert_eq!(mock.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.stats().failed, 1);
    assert_eq!(orchestrator.stats().completed, 0);
}

#[tokio::test]
async fn test_partial_failure_keeps_previous_rows() {
    let (_dir, repo) = open_repo();
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 2.0), ("BUSDT", 1.0)]));
    let hour = Timeframe::H1.duration_ms();
    mock.latest_open_time.store(10 * hour, Ordering::SeqCst);

    let orchestrator = Orchestrator::new(test_config(vec![Timeframe::H1]), mock.clone(), repo.clone());
    orchestrator.run_cycle(t0()).await.unwrap();

    // 第二轮 BUSDT 失败，它的旧数据不变
    mock.fail_symbol("BUSDT");
    mock.latest_open_time.store(12 * hour, Ordering::SeqCst);
    let report = orchestrator.run_cycle(t0() + ChronoDuration::minutes(5)).await.unwrap();

    assert_eq!(report.timeframes[0].succeeded, symbols(&["AUSDT"]));
    assert_eq!(report.timeframes[0].failed, symbols(&["BUSDT"]));

    let a_latest = repo.latest_candles(Timeframe::H1, "AUSDT", 1).unwrap();
    let b_latest = repo.latest_candles(Timeframe::H1, "BUSDT", 1).unwrap();
    assert_eq!(a_latest[0].open_time, 12 * hour);
    assert_eq!(b_latest[0].open_time, 10 * hour);
    assert_eq!(repo.count_rows(Timeframe::H1, "BUSDT").unwrap(), 5);
}

#[tokio::test]
async fn test_storage_failure_only_affects_its_timeframe() {
    let (_dir, repo) = open_repo();
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 2.0), ("BUSDT", 1.0)]));
    mock.latest_open_time.store(10 * Timeframe::D1.duration_ms(), Ordering::SeqCst);
    mock.make_unstorable(Timeframe::H1);

    let orchestrator = Orchestrator::new(test_config(vec![Timeframe::H1, Timeframe::D1]), mock, repo.clone());
    let report = orchestrator.run_cycle(t0()).await.unwrap();

    let h1 = &report.timeframes[0];
    assert_eq!(h1.timeframe, Timeframe::H1);
    assert!(h1.storage_error.is_some());
    assert!(h1.stored.is_none());

    let d1 = &report.timeframes[1];
    assert_eq!(d1.timeframe, Timeframe::D1);
    assert!(d1.storage_error.is_none());
    assert_eq!(d1.stored.as_ref().map(|s| s.upserted), Some(10));

    for symbol in ["AUSDT", "BUSDT"] {
        assert_eq!(repo.count_rows(Timeframe::H1, symbol).unwrap(), 0);
        assert_eq!(repo.count_rows(Timeframe::D1, symbol).unwrap(), 5);
    }
    assert_eq!(report.storage_failures(), 1);
    assert_eq!(orchestrator.stats().completed, 1);
    assert_eq!(orchestrator.stats().failed, 0);
}

#[tokio::test]
async fn test_two_cycles_with_overlap_keep_latest_five() {
    let (_dir, repo) = open_repo();
    let mock = Arc::new(MockExchange::with_turnovers(&[("XUSDT", 1.0)]));
    let hour = Timeframe::H1.duration_ms();

    // 第一轮 t0..t4
    mock.latest_open_time.store(4 * hour, Ordering::SeqCst);
    let orchestrator = Orchestrator::new(test_config(vec![Timeframe::H1]), mock.clone(), repo.clone());
    orchestrator.run_cycle(t0()).await.unwrap();

    // 第二轮 t3..t7，与第一轮重叠两根
    mock.latest_open_time.store(7 * hour, Ordering::SeqCst);
    let report = orchestrator.run_cycle(t0() + ChronoDuration::hours(3)).await.unwrap();

    let stored = report.timeframes[0].stored.clone().unwrap();
    assert_eq!(stored.upserted, 5);
    assert_eq!(stored.pruned, 3);

    let open_times: Vec<i64> = repo
        .latest_candles(Timeframe::H1, "XUSDT", 100)
        .unwrap()
        .into_iter()
        .map(|c| c.open_time)
        .collect();
    assert_eq!(open_times, vec![7 * hour, 6 * hour, 5 * hour, 4 * hour, 3 * hour]);
}

#[tokio::test]
async fn test_purge_untracked_symbols_when_enabled() {
    let (_dir, repo) = open_repo();
    let stale = Candle {
        symbol: "OLDUSDT".to_string(),
        open_time: 0,
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        volume: 1.0,
        turnover: None,
    };
    repo.upsert(Timeframe::M5, &[stale.clone()]).unwrap();
    repo.upsert(Timeframe::M15, &[stale]).unwrap();

    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 1.0)]));
    mock.latest_open_time.store(Timeframe::M5.duration_ms() * 100, Ordering::SeqCst);
    let config = FetcherConfig {
        purge_untracked_symbols: true,
        ..test_config(vec![Timeframe::M5])
    };

    let orchestrator = Orchestrator::new(config, mock, repo.clone());
    let report = orchestrator.run_cycle(t0()).await.unwrap();

    assert_eq!(report.timeframes[0].purged, 1);
    assert_eq!(repo.stored_symbols(Timeframe::M5).unwrap(), symbols(&["AUSDT"]));
    // 未配置的周期不处理
    assert_eq!(repo.count_rows(Timeframe::M15, "OLDUSDT").unwrap(), 1);
}

#[tokio::test]
async fn test_run_forever_stops_on_shutdown() {
    let (_dir, repo) = open_repo();
    let mock = Arc::new(MockExchange::with_turnovers(&[("AUSDT", 1.0)]));
    let config = FetcherConfig {
        fetch_interval_seconds: 3600,
        ..test_config(vec![Timeframe::M1])
    };

    let orchestrator = Orchestrator::new(config, mock, repo.clone());
    orchestrator
        .run_forever(tokio::time::sleep(Duration::from_millis(50)))
        .await;

    assert_eq!(orchestrator.stats().completed, 1);
    assert_eq!(repo.count_rows(Timeframe::M1, "AUSDT").unwrap(), 5);
}
