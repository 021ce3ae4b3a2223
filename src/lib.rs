// 导出模块
pub mod klcommon;
pub mod klfetch;

// Re-export error types
pub use klcommon::error::AppError;
