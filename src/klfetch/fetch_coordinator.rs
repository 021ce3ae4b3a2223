use crate::klcommon::{Candle, ExchangeClient, Timeframe};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

/// 单个品种的获取结果，`candles` 为 `None` 表示本轮获取失败
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentFetch {
    pub symbol: String,
    pub candles: Option<Vec<Candle>>,
}

impl InstrumentFetch {
    pub fn is_success(&self) -> bool {
        self.candles.is_some()
    }
}

/// 有界并发的K线获取器
///
/// 每个品种一个任务，信号量限制同时在途的请求数，全部完成后才返回
pub struct FetchCoordinator {
    client: Arc<dyn ExchangeClient>,
    concurrency_limit: usize,
    fetch_timeout: Duration,
}

impl FetchCoordinator {
    pub fn new(client: Arc<dyn ExchangeClient>, concurrency_limit: usize, fetch_timeout: Duration) -> Self {
        Self {
            client,
            concurrency_limit: concurrency_limit.max(1),
            fetch_timeout,
        }
    }

    /// 获取所有品种在某个周期下最近的 `history_limit` 根K线
    ///
    /// 结果与 `instruments` 顺序一致，单个品种的失败不影响其他品种
    pub async fn fetch_timeframe(
        &self,
        instruments: &[String],
        timeframe: Timeframe,
        history_limit: usize,
    ) -> Vec<InstrumentFetch> {
        let start_time = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut handles = Vec::with_capacity(instruments.len());

        for symbol in instruments {
            let semaphore_clone = semaphore.clone();
            let client = self.client.clone();
            let symbol_for_task = symbol.clone();
            let fetch_timeout = self.fetch_timeout;

            let span = tracing::debug_span!("fetch_instrument", symbol = %symbol, timeframe = %timeframe);
            let handle = tokio::spawn(async move {
                // 信号量只在本函数内使用，不会被关闭
                let _permit = match semaphore_clone.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };

                match tokio::time::timeout(fetch_timeout, client.fetch_candles(&symbol_for_task, timeframe, history_limit)).await {
                    Ok(candles) => candles,
                    Err(_) => {
                        warn!(
                            target: "coordinator",
                            timeout_ms = fetch_timeout.as_millis() as u64,
                            "{}/{}: 获取K线超时",
                            symbol_for_task,
                            timeframe
                        );
                        None
                    }
                }
            }.instrument(span));

            handles.push(handle);
        }

        // 等待所有任务完成，join_all 保持输入顺序
        let outcomes = join_all(handles).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (symbol, outcome) in instruments.iter().zip(outcomes) {
            let candles = match outcome {
                Ok(candles) => candles,
                Err(e) => {
                    error!(target: "coordinator", symbol = %symbol, "获取任务异常退出: {}", e);
                    None
                }
            };
            results.push(InstrumentFetch { symbol: symbol.clone(), candles });
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        if succeeded < results.len() {
            info!(
                target: "coordinator",
                timeframe = %timeframe,
                succeeded,
                failed = results.len() - succeeded,
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "周期获取完成，部分品种失败"
            );
        } else {
            debug!(
                target: "coordinator",
                timeframe = %timeframe,
                succeeded,
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "周期获取完成"
            );
        }

        results
    }
}
