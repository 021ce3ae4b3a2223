use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Symbol selection exhausted: {0}")]
    SelectionExhausted(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，作为日志中 `error.summary` 字段的稳定取值
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 行情获取
            AppError::ApiError(_) => "exchange_reported_error",
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::Timeout(_) => "market_data_request_timeout",

            // 数据解析
            AppError::JsonError(_) => "market_data_parsing_failed",
            AppError::ParseError(_) => "market_data_format_invalid",
            AppError::DataError(_) => "ohlcv_data_validation_failed",

            // 存储
            AppError::DatabaseError(_) => "ohlcv_persistence_failed",
            AppError::SqliteError(_) => "ohlcv_storage_operation_failed",

            // 品种选择
            AppError::SelectionExhausted(_) => "symbol_selection_exhausted",

            AppError::IoError(_) => "file_operation_failed",
            AppError::ConfigError(_) => "fetcher_configuration_invalid",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 周期性任务本身就是重试机制，这里只用于日志里标注下一轮是否有望恢复
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpError(_) |
            AppError::ApiError(_) |
            AppError::Timeout(_) |
            AppError::IoError(_) => true,

            // 上游暂时拿不到ticker，下一轮可能恢复
            AppError::SelectionExhausted(_) => true,

            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            },
            AppError::SqliteError(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            AppError::SqliteError(_) => false,

            AppError::JsonError(_) |
            AppError::ParseError(_) |
            AppError::DataError(_) |
            AppError::ConfigError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
