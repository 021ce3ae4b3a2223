// 导出共享模块
pub mod models;
pub mod db;
pub mod error;
pub mod config;
pub mod api;
pub mod logging_setup;

// 重新导出常用类型，方便使用
pub use models::{Candle, TickerSnapshot, TargetSet, Timeframe, SUPPORTED_TIMEFRAMES};
pub use db::{OhlcvRepository, StoreSummary};
pub use error::{Result, AppError};
pub use config::FetcherConfig;
pub use api::{BybitClient, ExchangeClient};
