use crate::klcommon::{AppError, ExchangeClient, Result, TargetSet, TickerSnapshot};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// 目标品种选择器
///
/// 持有当前的 `TargetSet`，过期后按24小时成交额重新排名。
/// 刷新失败时保留旧的集合，只有从未成功选择过时才返回错误
pub struct SymbolSelector {
    client: Arc<dyn ExchangeClient>,
    top_k: usize,
    ttl: Duration,
    current: RwLock<Option<Arc<TargetSet>>>,
}

impl SymbolSelector {
    pub fn new(client: Arc<dyn ExchangeClient>, top_k: usize, ttl: Duration) -> Self {
        Self {
            client,
            top_k,
            ttl,
            current: RwLock::new(None),
        }
    }

    /// 当前的目标集合，不触发刷新
    pub async fn current(&self) -> Option<Arc<TargetSet>> {
        self.current.read().await.clone()
    }

    /// 返回未过期的目标集合，过期或不存在时刷新
    pub async fn ensure_fresh(&self, now: DateTime<Utc>) -> Result<Arc<TargetSet>> {
        if let Some(set) = self.current().await {
            if !set.is_expired(now) {
                debug!(
                    target: "selector",
                    decision = "cache_hit",
                    count = set.len(),
                    selected_at = %set.selected_at,
                    "使用缓存的目标品种"
                );
                return Ok(set);
            }
            info!(target: "selector", selected_at = %set.selected_at, "目标品种缓存已过期，重新选择");
        }

        self.refresh(now).await
    }

    /// 忽略有效期，强制重新选择
    #[instrument(skip(self), fields(top_k = self.top_k), err)]
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<Arc<TargetSet>> {
        let outcome = self.select_top(now).await;

        let mut guard = self.current.write().await;
        match outcome {
            Ok(Some(set)) => {
                let set = Arc::new(set);
                *guard = Some(set.clone());
                info!(target: "selector", count = set.len(), "目标品种已更新");
                Ok(set)
            },
            Ok(None) => match guard.as_ref() {
                Some(stale) => {
                    warn!(
                        target: "selector",
                        decision = "keep_stale",
                        selected_at = %stale.selected_at,
                        "Ticker为空，继续使用旧的目标品种"
                    );
                    Ok(stale.clone())
                },
                None => Err(AppError::SelectionExhausted("Ticker为空且没有可用的目标品种".to_string())),
            },
            Err(e) => match guard.as_ref() {
                Some(stale) => {
                    warn!(
                        target: "selector",
                        decision = "keep_stale",
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "获取Ticker失败，继续使用旧的目标品种"
                    );
                    Ok(stale.clone())
                },
                None => {
                    error!(
                        target: "selector",
                        { error.summary = e.get_error_type_summary(), error.details = %e },
                        "获取Ticker失败且没有可用的目标品种"
                    );
                    Err(AppError::SelectionExhausted(format!("获取Ticker失败: {}", e)))
                }
            },
        }
    }

    /// 按成交额选出前 K 个品种，没有可用的 ticker 时返回 `None`
    async fn select_top(&self, now: DateTime<Utc>) -> Result<Option<TargetSet>> {
        let tickers = self.client.snapshot_tickers().await?;
        if tickers.is_empty() {
            return Ok(None);
        }

        let tickers = self.filter_tradable(tickers).await;
        if tickers.is_empty() {
            return Ok(None);
        }

        let ranked = rank_by_turnover(tickers, self.top_k);
        for (index, ticker) in ranked.iter().enumerate() {
            info!(
                target: "selector",
                rank = index + 1,
                symbol = %ticker.symbol,
                turnover_24h = ticker.turnover_24h,
                price_change_pct_24h = ?ticker.price_change_pct_24h,
                "目标品种"
            );
        }

        let symbols = ranked.into_iter().map(|t| t.symbol).collect();
        Ok(Some(TargetSet::new(symbols, now, self.ttl)))
    }

    /// 只保留可交易品种；列表为空或获取失败时视为未知，不过滤
    async fn filter_tradable(&self, tickers: Vec<TickerSnapshot>) -> Vec<TickerSnapshot> {
        let tradable: HashSet<String> = match self.client.list_tradable_instruments().await {
            Ok(list) if !list.is_empty() => list.into_iter().collect(),
            Ok(_) => {
                warn!(target: "selector", decision = "skip_tradable_filter", "可交易品种列表为空，跳过过滤");
                return tickers;
            },
            Err(e) => {
                warn!(
                    target: "selector",
                    decision = "skip_tradable_filter",
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "获取可交易品种失败，跳过过滤"
                );
                return tickers;
            }
        };

        let before = tickers.len();
        let filtered: Vec<TickerSnapshot> = tickers
            .into_iter()
            .filter(|t| tradable.contains(&t.symbol))
            .collect();

        if filtered.len() < before {
            debug!(target: "selector", dropped = before - filtered.len(), "过滤掉不可交易的品种");
        }
        filtered
    }
}

/// 按24小时成交额降序排序（稳定排序，成交额相同时保持原顺序），取前 `top_k` 个
pub fn rank_by_turnover(mut tickers: Vec<TickerSnapshot>, top_k: usize) -> Vec<TickerSnapshot> {
    tickers.sort_by(|a, b| b.turnover_24h.total_cmp(&a.turnover_24h));
    tickers.truncate(top_k);
    tickers
}
