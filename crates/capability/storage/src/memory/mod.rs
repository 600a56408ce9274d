//! 内存存储实现模块
//!
//! - InMemoryCatalog：目录快照 + 最新值
//! - InMemoryHistorySink：历史记录（测试与演示）
//! - TracingHistorySink：仅输出日志的历史写入

pub mod catalog;
pub mod history;

pub use catalog::*;
pub use history::*;
