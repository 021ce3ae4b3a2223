use crate::klcommon::{AppError, Candle, Result, TickerSnapshot, Timeframe};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// 单页最多返回的品种数
const INSTRUMENTS_PAGE_LIMIT: &str = "1000";

/// 行情源抽象
///
/// 所有实现都不保存本地状态；`fetch_candles` 的失败只影响单个品种，
/// 因此以 `None` 表示而不是返回错误
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// 分页获取所有可交易品种。上游返回错误码时结果为空（表示“未知”，不是“没有品种”）
    async fn list_tradable_instruments(&self) -> Result<Vec<String>>;

    /// 获取全部品种的24小时行情快照。上游返回错误码时结果为空
    async fn snapshot_tickers(&self) -> Result<Vec<TickerSnapshot>>;

    /// 获取最近 `limit` 根K线（最新的在前）。任何失败都返回 `None`
    async fn fetch_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Option<Vec<Candle>>;
}

/// Bybit v5 统一响应包
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentsPage {
    #[serde(default)]
    list: Vec<InstrumentInfo>,
    #[serde(default)]
    next_page_cursor: String,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    #[serde(default)]
    symbol: String,
}

#[derive(Debug, Default, Deserialize)]
struct TickerList {
    #[serde(default)]
    list: Vec<RawTicker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    #[serde(default)]
    symbol: String,
    #[serde(default, rename = "turnover24h")]
    turnover_24h: Option<String>,
    #[serde(default)]
    price24h_pcnt: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KlineList {
    #[serde(default)]
    list: Vec<Vec<Value>>,
}

/// Bybit API客户端
#[derive(Clone, Debug)]
pub struct BybitClient {
    client: Client,
    base_url: String,
    quote_suffix: String,
    request_timeout: Duration,
    page_delay: Duration,
    max_pages: usize,
}

impl BybitClient {
    /// 创建新的API客户端实例
    #[instrument(skip_all, fields(base_url = %base_url), err)]
    pub fn new(base_url: &str, quote_suffix: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?;

        info!(target: "api", "初始化Bybit API客户端，端点: {}", base_url);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            quote_suffix: quote_suffix.to_string(),
            request_timeout,
            page_delay: Duration::from_millis(100),
            max_pages: 100,
        })
    }

    /// 设置分页请求之间的间隔
    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// 设置分页上限，防止上游游标一直不结束
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// 发送 GET 请求并解析响应包，HTTP 状态码非 2xx 视为上游错误
    async fn get_envelope<T>(&self, path: &str, params: &[(&str, &str)]) -> Result<BybitResponse<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, path);

        let response = self.client.get(&url).query(params).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::ApiError(format!(
                "{} 返回 {} - {}",
                path,
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let body = response.text().await?;
        let envelope = serde_json::from_str::<BybitResponse<T>>(&body)?;
        Ok(envelope)
    }

    fn matches_quote(&self, symbol: &str) -> bool {
        !symbol.is_empty() && symbol.ends_with(&self.quote_suffix)
    }

    async fn try_fetch_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let limit = limit.to_string();
        let params = [
            ("category", "linear"),
            ("symbol", symbol),
            ("interval", timeframe.exchange_interval()),
            ("limit", limit.as_str()),
        ];

        let envelope: BybitResponse<KlineList> = self.get_envelope("/v5/market/kline", &params).await?;

        if envelope.ret_code != 0 {
            return Err(AppError::ApiError(format!("retCode={} retMsg={}", envelope.ret_code, envelope.ret_msg)));
        }

        let rows = envelope.result.unwrap_or_default().list;
        // 任意一行无效则整个品种本轮视为失败，不返回部分数据
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            candles.push(Candle::from_raw_row(symbol, row)?);
        }

        Ok(candles)
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    #[instrument(skip(self), err)]
    async fn list_tradable_instruments(&self) -> Result<Vec<String>> {
        info!(target: "api", "分页获取全部 linear 品种...");

        let mut symbols = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = String::new();

        for page in 1..=self.max_pages {
            let mut params = vec![
                ("category", "linear"),
                ("status", "Trading"),
                ("limit", INSTRUMENTS_PAGE_LIMIT),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.as_str()));
            }

            let envelope: BybitResponse<InstrumentsPage> =
                self.get_envelope("/v5/market/instruments-info", &params).await?;

            if envelope.ret_code != 0 {
                // 不返回部分结果
                error!(
                    target: "api",
                    page,
                    ret_code = envelope.ret_code,
                    "获取品种列表时上游返回错误: {}", envelope.ret_msg
                );
                return Ok(Vec::new());
            }

            let result = envelope.result.unwrap_or_default();
            for item in result.list {
                if self.matches_quote(&item.symbol) && seen.insert(item.symbol.clone()) {
                    symbols.push(item.symbol);
                }
            }

            if result.next_page_cursor.is_empty() {
                info!(target: "api", pages = page, "共发现 {} 个可交易的 linear 品种", symbols.len());
                return Ok(symbols);
            }

            cursor = result.next_page_cursor;
            debug!(target: "api", page, cursor = %cursor, "继续获取下一页");

            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        error!(target: "api", max_pages = self.max_pages, "品种列表分页超过上限，放弃本次结果");
        Ok(Vec::new())
    }

    #[instrument(skip(self), err)]
    async fn snapshot_tickers(&self) -> Result<Vec<TickerSnapshot>> {
        let envelope: BybitResponse<TickerList> =
            self.get_envelope("/v5/market/tickers", &[("category", "linear")]).await?;

        if envelope.ret_code != 0 {
            error!(target: "api", ret_code = envelope.ret_code, "获取Ticker时上游返回错误: {}", envelope.ret_msg);
            return Ok(Vec::new());
        }

        let mut tickers = Vec::new();
        for raw in envelope.result.unwrap_or_default().list {
            if !self.matches_quote(&raw.symbol) {
                continue;
            }

            let turnover = raw.turnover_24h.as_deref().unwrap_or("0").parse::<f64>();
            match turnover {
                Ok(turnover_24h) => tickers.push(TickerSnapshot {
                    symbol: raw.symbol,
                    turnover_24h,
                    price_change_pct_24h: raw.price24h_pcnt.as_deref().and_then(|s| s.parse::<f64>().ok()),
                }),
                Err(e) => {
                    warn!(target: "api", symbol = %raw.symbol, "turnover24h 无法解析，已忽略: {}", e);
                }
            }
        }

        info!(target: "api", "共获取 {} 个品种的Ticker", tickers.len());
        Ok(tickers)
    }

    #[instrument(skip_all, fields(symbol = %symbol, timeframe = %timeframe, limit = limit))]
    async fn fetch_candles(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Option<Vec<Candle>> {
        let outcome = tokio::time::timeout(self.request_timeout, self.try_fetch_candles(symbol, timeframe, limit))
            .await
            .unwrap_or_else(|_| Err(AppError::Timeout(self.request_timeout.as_millis() as u64)));

        match outcome {
            Ok(candles) => {
                debug!(target: "api", count = candles.len(), "{}/{}: 获取K线成功", symbol, timeframe);
                Some(candles)
            },
            Err(e) => {
                warn!(
                    target: "api",
                    { error.summary = e.get_error_type_summary(), error.details = %e },
                    "{}/{}: 获取K线失败",
                    symbol,
                    timeframe
                );
                None
            }
        }
    }
}
