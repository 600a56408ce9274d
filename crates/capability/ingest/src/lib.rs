//! # EMS Ingest 模块
//!
//! 把目录、三个协议管理器、流水线和外发发布循环装配成一个可启动/关闭的采集引擎。
//!
//! - [`sync`]：目录 → 管理器同步
//! - [`service`]：协议服务循环（等待加载信号、同步、连接；PLC 附带轮询调度器）
//! - [`engine`]：五个长期任务的装配与分阶段关闭

pub mod engine;
pub mod error;
pub mod service;
pub mod sync;

pub use engine::{Engine, EngineDeps, EngineHandle, ShutdownReport};
pub use error::IngestError;
pub use service::{ProtocolService, ReloadReport};
pub use sync::{SyncReport, sync_manager};
