//! 行情采集服务配置模块
//!
//! 优先读取 `CONFIG_PATH` 指向的 TOML 文件，文件不存在时回退到环境变量（支持 `.env`）

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::klcommon::models::Timeframe;
use crate::klcommon::{AppError, Result};

/// 系统配置常量
pub mod constants {
    /// 默认配置文件路径
    pub const DEFAULT_CONFIG_PATH: &str = "config/fetcher.toml";

    /// 默认处理的时间周期
    pub const DEFAULT_TIMEFRAMES: &str = "1m,5m,15m,30m,1h,4h,1d";

    pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;
    pub const DEFAULT_FETCH_INTERVAL_SECONDS: u64 = 300;
    pub const DEFAULT_OHLCV_HISTORY_LIMIT: usize = 5;
    pub const DEFAULT_LOG_MAX_SIZE_MB: u64 = 10;
    pub const DEFAULT_BASE_URL: &str = "https://api.bybit.com";
    pub const DEFAULT_DB_PATH: &str = "data/cmma.db";
    pub const DEFAULT_LOG_DIR: &str = "logs";
    pub const DEFAULT_TOP_SYMBOLS_COUNT: usize = 30;
    pub const DEFAULT_SYMBOL_CACHE_TTL_HOURS: u64 = 24;
    pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;
    pub const DEFAULT_QUOTE_SUFFIX: &str = "USDT";
}

use constants::*;

/// 行情采集服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// 按顺序处理的时间周期
    #[serde(deserialize_with = "deserialize_timeframes")]
    pub timeframes: Vec<Timeframe>,

    /// 单个周期内同时在途的K线请求数
    pub concurrency_limit: usize,

    /// 两轮采集之间的间隔（秒）
    pub fetch_interval_seconds: u64,

    /// 每个品种每个周期保留的K线数量，同时也是单次请求的 limit
    pub ohlcv_history_limit: usize,

    /// 日志文件滚动阈值（MB）
    pub log_max_size_mb: u64,

    /// Bybit API 地址
    pub base_url: String,

    /// SQLite 数据库文件路径
    pub db_path: PathBuf,

    /// 日志目录
    pub log_dir: PathBuf,

    /// 按24小时成交额选取的品种数
    pub top_symbols_count: usize,

    /// 品种列表缓存有效期（小时）
    pub symbol_cache_ttl_hours: u64,

    /// 单次请求超时（秒）
    pub request_timeout_seconds: u64,

    /// 只跟踪以该后缀结尾的交易对
    pub quote_suffix: String,

    /// 是否清理已经不在目标集合中的品种的历史数据
    pub purge_untracked_symbols: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeframes: parse_timeframe_list(DEFAULT_TIMEFRAMES),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            fetch_interval_seconds: DEFAULT_FETCH_INTERVAL_SECONDS,
            ohlcv_history_limit: DEFAULT_OHLCV_HISTORY_LIMIT,
            log_max_size_mb: DEFAULT_LOG_MAX_SIZE_MB,
            base_url: DEFAULT_BASE_URL.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            top_symbols_count: DEFAULT_TOP_SYMBOLS_COUNT,
            symbol_cache_ttl_hours: DEFAULT_SYMBOL_CACHE_TTL_HOURS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            quote_suffix: DEFAULT_QUOTE_SUFFIX.to_string(),
            purge_untracked_symbols: false,
        }
    }
}

impl FetcherConfig {
    /// 加载配置：配置文件存在时读文件，否则读环境变量
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let config_path = match explicit_path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(
                std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
            ),
        };

        if config_path.exists() {
            info!(target: "config", "从配置文件加载配置: {}", config_path.display());
            return Self::from_file(&config_path);
        }

        if explicit_path.is_some() {
            return Err(AppError::ConfigError(format!("配置文件不存在: {}", config_path.display())));
        }

        info!(target: "config", "配置文件 {} 不存在，使用环境变量", config_path.display());
        Self::from_env()
    }

    /// 从 TOML 文件加载配置
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 从进程环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意键值来源加载配置，缺失的键使用默认值
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            timeframes: lookup("TIMEFRAMES")
                .map(|raw| parse_timeframe_list(&raw))
                .unwrap_or(defaults.timeframes),
            concurrency_limit: parse_or(&lookup, "CONCURRENCY_LIMIT", defaults.concurrency_limit)?,
            fetch_interval_seconds: parse_or(&lookup, "FETCH_INTERVAL_SECONDS", defaults.fetch_interval_seconds)?,
            ohlcv_history_limit: parse_or(&lookup, "OHLCV_HISTORY_LIMIT", defaults.ohlcv_history_limit)?,
            log_max_size_mb: parse_or(&lookup, "LOG_MAX_SIZE_MB", defaults.log_max_size_mb)?,
            base_url: lookup("BYBIT_BASE_URL").unwrap_or(defaults.base_url),
            db_path: lookup("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            log_dir: lookup("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            top_symbols_count: parse_or(&lookup, "TOP_SYMBOLS_COUNT", defaults.top_symbols_count)?,
            symbol_cache_ttl_hours: parse_or(&lookup, "SYMBOL_CACHE_TTL_HOURS", defaults.symbol_cache_ttl_hours)?,
            request_timeout_seconds: parse_or(&lookup, "REQUEST_TIMEOUT_SECONDS", defaults.request_timeout_seconds)?,
            quote_suffix: lookup("QUOTE_SUFFIX").unwrap_or(defaults.quote_suffix),
            purge_untracked_symbols: parse_or(&lookup, "PURGE_UNTRACKED_SYMBOLS", defaults.purge_untracked_symbols)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.timeframes.is_empty() {
            return Err(AppError::ConfigError("时间周期列表不能为空".to_string()));
        }

        if self.concurrency_limit == 0 {
            return Err(AppError::ConfigError("并发数必须大于0".to_string()));
        }

        if self.fetch_interval_seconds == 0 {
            return Err(AppError::ConfigError("采集间隔必须大于0".to_string()));
        }

        if self.ohlcv_history_limit == 0 {
            return Err(AppError::ConfigError("K线保留数量必须大于0".to_string()));
        }

        if self.top_symbols_count == 0 {
            return Err(AppError::ConfigError("目标品种数必须大于0".to_string()));
        }

        if self.request_timeout_seconds == 0 {
            return Err(AppError::ConfigError("请求超时必须大于0".to_string()));
        }

        if self.base_url.trim().is_empty() {
            return Err(AppError::ConfigError("API地址不能为空".to_string()));
        }

        Ok(())
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn symbol_cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.symbol_cache_ttl_hours as i64)
    }

    pub fn log_max_size_bytes(&self) -> u64 {
        self.log_max_size_mb.saturating_mul(1024 * 1024)
    }
}

/// 解析逗号分隔的周期列表，不支持的周期跳过并告警，重复的只保留第一次
pub fn parse_timeframe_list(raw: &str) -> Vec<Timeframe> {
    let mut timeframes = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.parse::<Timeframe>() {
            Ok(tf) if !timeframes.contains(&tf) => timeframes.push(tf),
            Ok(_) => warn!(target: "config", "重复的时间周期: {}，已忽略", item),
            Err(_) => warn!(target: "config", "未支持的时间周期: {}，已跳过", item),
        }
    }
    timeframes
}

fn deserialize_timeframes<'de, D>(deserializer: D) -> std::result::Result<Vec<Timeframe>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(parse_timeframe_list(&raw.join(",")))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AppError::ConfigError(format!("{} 的值 '{}' 无效: {}", key, raw, e))),
        _ => Ok(default),
    }
}
