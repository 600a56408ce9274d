//! 外部协作方接口
//!
//! - VariableCatalog：设备/变量目录（引擎只读，值写入只由流水线写入阶段调用）
//! - HistorySink：变量历史追加（即发即忘，失败只记录日志）

use crate::error::StorageError;
use async_trait::async_trait;
use domain::{
    ConnectionState, Device, DeviceId, Protocol, Variable, VariableId, VariableValue,
};
use tokio::sync::watch;

/// 设备/变量目录接口
#[async_trait]
pub trait VariableCatalog: Send + Sync {
    /// 列出指定协议的全部设备（含未激活设备）
    async fn list_devices(&self, protocol: Protocol) -> Result<Vec<Device>, StorageError>;

    /// 查找设备
    async fn find_device(&self, device_id: DeviceId) -> Result<Option<Device>, StorageError>;

    /// 列出指定协议的全部变量
    async fn list_variables(&self, protocol: Protocol) -> Result<Vec<Variable>, StorageError>;

    /// 查找变量
    async fn find_variable(
        &self,
        variable_id: VariableId,
    ) -> Result<Option<Variable>, StorageError>;

    /// 写入变量最新值与时间戳，返回写入后的变量快照。
    ///
    /// 唯一调用方是流水线的写入阶段。
    async fn apply_value(
        &self,
        variable_id: VariableId,
        value: &VariableValue,
        ts_ms: i64,
    ) -> Result<Option<Variable>, StorageError>;

    /// 记录设备连接状态投影
    async fn set_connection_state(
        &self,
        device_id: DeviceId,
        state: ConnectionState,
    ) -> Result<(), StorageError>;

    /// 目录加载代数；0 表示尚未完成首次加载，每次（重新）加载后递增。
    fn load_signal(&self) -> watch::Receiver<u64>;
}

/// 变量历史写入接口
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn append(
        &self,
        variable_id: VariableId,
        value: &VariableValue,
        ts_ms: i64,
    ) -> Result<(), StorageError>;
}
