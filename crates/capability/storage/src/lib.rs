//! # EMS Storage 模块
//!
//! 采集引擎的外部协作方接口与内存实现。
//!
//! - [`traits`]：`VariableCatalog`（设备/变量目录）与 `HistorySink`（历史写入）
//! - [`models`]：目录文件记录结构，以及到领域模型的显式转换
//! - [`loader`]：目录 JSON 文件读取
//! - [`memory`]：内存目录、内存历史与日志历史实现
//!
//! 引擎对目录只读；变量值只由流水线写入阶段通过 `apply_value` 写入。

pub mod error;
pub mod loader;
pub mod memory;
pub mod models;
pub mod traits;

pub use error::*;
pub use loader::{load_catalog_file, parse_catalog};
pub use memory::{HistoryEntry, InMemoryCatalog, InMemoryHistorySink, TracingHistorySink};
pub use models::*;
pub use traits::*;
