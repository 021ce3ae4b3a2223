use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::klcommon::error::AppError;

/// 支持的K线周期，顺序即默认处理顺序
pub const SUPPORTED_TIMEFRAMES: [Timeframe; 9] = [
    Timeframe::M1,
    Timeframe::M5,
    Timeframe::M15,
    Timeframe::M30,
    Timeframe::H1,
    Timeframe::H4,
    Timeframe::D1,
    Timeframe::W1,
    Timeframe::Mo1,
];

/// K线周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    Mo1,
}

impl Timeframe {
    /// 配置和日志里使用的名字，例如 "1h"
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Mo1 => "1M",
        }
    }

    /// Bybit v5 kline 接口的 interval 参数
    pub fn exchange_interval(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::M30 => "30",
            Timeframe::H1 => "60",
            Timeframe::H4 => "240",
            Timeframe::D1 => "D",
            Timeframe::W1 => "W",
            Timeframe::Mo1 => "M",
        }
    }

    /// 每个周期一张表。SQLite 表名大小写不敏感，月线不能叫 ohlcv_1M
    pub fn table_name(&self) -> &'static str {
        match self {
            Timeframe::M1 => "ohlcv_1m",
            Timeframe::M5 => "ohlcv_5m",
            Timeframe::M15 => "ohlcv_15m",
            Timeframe::M30 => "ohlcv_30m",
            Timeframe::H1 => "ohlcv_1h",
            Timeframe::H4 => "ohlcv_4h",
            Timeframe::D1 => "ohlcv_1d",
            Timeframe::W1 => "ohlcv_1w",
            Timeframe::Mo1 => "ohlcv_1mo",
        }
    }

    /// 周期长度（毫秒），月线按30天估算
    #[cfg(test)]
    pub(crate) fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60 * 1000;
        match self {
            Timeframe::M1 => MINUTE,
            Timeframe::M5 => 5 * MINUTE,
            Timeframe::M15 => 15 * MINUTE,
            Timeframe::M30 => 30 * MINUTE,
            Timeframe::H1 => 60 * MINUTE,
            Timeframe::H4 => 240 * MINUTE,
            Timeframe::D1 => 24 * 60 * MINUTE,
            Timeframe::W1 => 7 * 24 * 60 * MINUTE,
            Timeframe::Mo1 => 30 * 24 * 60 * MINUTE,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = AppError;

    // 注意 "1m"（分钟）和 "1M"（月）区分大小写
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SUPPORTED_TIMEFRAMES
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s.trim())
            .ok_or_else(|| AppError::ConfigError(format!("不支持的K线周期: {}", s)))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// 一根K线，周期由所在的批次/表决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// 开盘时间（毫秒时间戳）
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// 成交额（计价币种），部分行情源不提供
    pub turnover: Option<f64>,
}

impl Candle {
    /// Convert a raw kline row from the Bybit API to a Candle
    ///
    /// 行格式: `[startTime, open, high, low, close, volume, turnover]`，
    /// 数值一般以字符串形式返回，数字形式也兼容。
    /// 格式错误返回 `ParseError`，NaN/inf 等非有限数值返回 `DataError`
    pub fn from_raw_row(symbol: &str, raw: &[serde_json::Value]) -> Result<Self, AppError> {
        if raw.len() < 6 {
            return Err(AppError::ParseError(format!("{} K线字段不足: {:?}", symbol, raw)));
        }

        let price = |index: usize, name: &str| -> Result<f64, AppError> {
            let value = match &raw[index] {
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                serde_json::Value::Number(n) => n.as_f64(),
                _ => None,
            }
            .ok_or_else(|| AppError::ParseError(format!("{} {} 无法解析: {}", symbol, name, raw[index])))?;

            if !value.is_finite() {
                return Err(AppError::DataError(format!("{} {} 不是有限数值: {}", symbol, name, raw[index])));
            }
            Ok(value)
        };

        let open_time = match &raw[0] {
            serde_json::Value::String(s) => s.parse::<i64>().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        }
        .ok_or_else(|| AppError::ParseError(format!("{} 开盘时间无法解析: {}", symbol, raw[0])))?;

        let turnover = match raw.get(6) {
            Some(_) => Some(price(6, "turnover")?),
            None => None,
        };

        Ok(Candle {
            symbol: symbol.to_string(),
            open_time,
            open: price(1, "open")?,
            high: price(2, "high")?,
            low: price(3, "low")?,
            close: price(4, "close")?,
            volume: price(5, "volume")?,
            turnover,
        })
    }
}

/// 24小时行情快照，用于按成交额挑选品种
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub turnover_24h: f64,
    /// 24小时涨跌幅（小数形式，0.05 表示 +5%），上游缺失时为 None
    pub price_change_pct_24h: Option<f64>,
}

/// 当前需要跟踪的品种集合
///
/// 由 `SymbolSelector` 整体替换，其他组件只读
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSet {
    pub symbols: Vec<String>,
    pub selected_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl TargetSet {
    pub fn new(symbols: Vec<String>, selected_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self { symbols, selected_at, ttl }
    }

    /// `now - selected_at >= ttl` 时视为过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.selected_at >= self.ttl
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
