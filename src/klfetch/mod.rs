// 行情采集服务相关模块
pub mod symbol_selector;
pub mod fetch_coordinator;
pub mod orchestrator;

#[cfg(test)]
mod tests;

// 重新导出常用类型，方便使用
pub use symbol_selector::SymbolSelector;
pub use fetch_coordinator::{FetchCoordinator, InstrumentFetch};
pub use orchestrator::{CycleReport, CycleStats, Orchestrator, TimeframeReport};
