use crate::klcommon::{Candle, ExchangeClient, FetcherConfig, OhlcvRepository, Result, StoreSummary, TargetSet, Timeframe};
use crate::klfetch::fetch_coordinator::FetchCoordinator;
use crate::klfetch::symbol_selector::SymbolSelector;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 单个周期的处理结果
#[derive(Debug, Clone, PartialEq)]
pub struct TimeframeReport {
    pub timeframe: Timeframe,
    /// 获取成功的品种（保持目标集合的顺序）
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// 写入结果，没有可写入的数据时为 `None`
    pub stored: Option<StoreSummary>,
    pub storage_error: Option<String>,
    /// 清理掉的不再跟踪品种的行数
    pub purged: usize,
}

/// 一轮采集的结果，只用于日志和测试，不持久化
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub target_count: usize,
    pub timeframes: Vec<TimeframeReport>,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn storage_failures(&self) -> usize {
        self.timeframes.iter().filter(|r| r.storage_error.is_some()).count()
    }

    pub fn fetch_failures(&self) -> usize {
        self.timeframes.iter().map(|r| r.failed.len()).sum()
    }
}

/// 运行计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub completed: u64,
    pub failed: u64,
}

/// 采集编排器
///
/// 一轮: 选品种 -> 按配置顺序逐个周期获取 -> 写入并清理
pub struct Orchestrator {
    config: FetcherConfig,
    selector: SymbolSelector,
    coordinator: FetchCoordinator,
    repository: OhlcvRepository,
    completed_cycles: AtomicU64,
    failed_cycles: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: FetcherConfig, client: Arc<dyn ExchangeClient>, repository: OhlcvRepository) -> Self {
        let selector = SymbolSelector::new(client.clone(), config.top_symbols_count, config.symbol_cache_ttl());
        let coordinator = FetchCoordinator::new(client, config.concurrency_limit, config.request_timeout());

        Self {
            config,
            selector,
            coordinator,
            repository,
            completed_cycles: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
        }
    }

    pub fn selector(&self) -> &SymbolSelector {
        &self.selector
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats {
            completed: self.completed_cycles.load(Ordering::Relaxed),
            failed: self.failed_cycles.load(Ordering::Relaxed),
        }
    }

    /// 执行一轮采集
    ///
    /// 只有选品种失败会让整轮失败；单个周期的写入失败记录在报告里，继续处理下一个周期
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let start_time = Instant::now();
        info!(target: "orchestrator", started_at = %now, "开始新一轮采集");

        let target = match self.selector.ensure_fresh(now).await {
            Ok(target) => target,
            Err(e) => {
                self.failed_cycles.fetch_add(1, Ordering::Relaxed);
                error!(
                    target: "orchestrator",
                    { error.summary = e.get_error_type_summary(), error.details = %e },
                    "选择目标品种失败，本轮采集中止"
                );
                return Err(e);
            }
        };

        let mut reports = Vec::with_capacity(self.config.timeframes.len());
        for timeframe in &self.config.timeframes {
            reports.push(self.process_timeframe(&target, *timeframe).await);
        }

        let report = CycleReport {
            started_at: now,
            target_count: target.len(),
            timeframes: reports,
            elapsed: start_time.elapsed(),
        };
        self.completed_cycles.fetch_add(1, Ordering::Relaxed);

        info!(
            target: "orchestrator",
            symbols = report.target_count,
            timeframes = report.timeframes.len(),
            fetch_failures = report.fetch_failures(),
            storage_failures = report.storage_failures(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "本轮采集完成"
        );

        Ok(report)
    }

    async fn process_timeframe(&self, target: &TargetSet, timeframe: Timeframe) -> TimeframeReport {
        let history_limit = self.config.ohlcv_history_limit;
        let results = self
            .coordinator
            .fetch_timeframe(&target.symbols, timeframe, history_limit)
            .await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut records: Vec<Candle> = Vec::new();
        for result in results {
            match result.candles {
                Some(candles) => {
                    succeeded.push(result.symbol);
                    records.extend(candles);
                },
                None => failed.push(result.symbol),
            }
        }

        let mut report = TimeframeReport {
            timeframe,
            succeeded,
            failed,
            stored: None,
            storage_error: None,
            purged: 0,
        };

        if records.is_empty() {
            debug!(target: "orchestrator", decision = "skip_store", timeframe = %timeframe, "没有获取到K线，跳过写入");
        } else {
            match self.repository.store_batch(timeframe, &records, history_limit) {
                Ok(summary) => {
                    info!(
                        target: "orchestrator",
                        timeframe = %timeframe,
                        symbols = report.succeeded.len(),
                        upserted = summary.upserted,
                        pruned = summary.pruned,
                        "周期数据已写入"
                    );
                    report.stored = Some(summary);
                },
                Err(e) => {
                    error!(
                        target: "orchestrator",
                        timeframe = %timeframe,
                        retryable = e.is_retryable(),
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "周期数据写入失败，继续下一个周期"
                    );
                    report.storage_error = Some(e.to_string());
                }
            }
        }

        if self.config.purge_untracked_symbols {
            match self.repository.purge_untracked(timeframe, target.symbols.as_slice()) {
                Ok(purged) => report.purged = purged,
                Err(e) => {
                    warn!(
                        target: "orchestrator",
                        timeframe = %timeframe,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "清理不再跟踪的品种失败"
                    );
                }
            }
        }

        report
    }

    /// 按固定间隔循环执行，直到 `shutdown` 完成
    ///
    /// 下一轮的时间从本轮开始时计算；本轮超时则立即开始下一轮，两轮不会重叠
    pub async fn run_forever<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let interval = self.config.fetch_interval();
        info!(target: "orchestrator", interval_secs = interval.as_secs(), "启动周期采集任务");

        loop {
            let cycle_start = Instant::now();
            // 失败已在 run_cycle 内记录
            let _ = self.run_cycle(Utc::now()).await;

            let next_due = cycle_start + interval;
            let now = Instant::now();
            if now >= next_due {
                warn!(
                    target: "orchestrator",
                    overrun_ms = (now - next_due).as_millis() as u64,
                    "本轮采集耗时超过间隔，立即开始下一轮"
                );
            } else {
                debug!(target: "orchestrator", wait_ms = (next_due - now).as_millis() as u64, "等待下一轮采集");
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(target: "orchestrator", stats = ?self.stats(), "收到停止信号，退出采集循环");
                    break;
                }
                _ = tokio::time::sleep_until(next_due) => {}
            }
        }
    }
}
