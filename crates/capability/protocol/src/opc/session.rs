//! OPC UA 会话抽象
//!
//! 引擎只依赖这里列出的服务集合；具体客户端（async-opcua）在 `ua` 模块中实现，
//! 测试里用手写的假会话替换。

use crate::error::ProtocolError;
use async_trait::async_trait;
use domain::{OpcEndpoint, VariableValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// 节点类别（只区分浏览时关心的几类）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Object,
    Variable,
    Method,
    Other,
}

/// 浏览得到的一条引用
#[derive(Debug, Clone, PartialEq)]
pub struct BrowseEntry {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    pub node_class: NodeClass,
}

/// 一页浏览结果；`continuation` 非空表示还有下一页
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowsePage {
    pub entries: Vec<BrowseEntry>,
    pub continuation: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredItemSpec {
    pub node_id: String,
    pub sampling_interval_ms: u64,
}

/// 订阅通知
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub node_id: String,
    pub value: VariableValue,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Disconnected(String),
}

#[async_trait]
pub trait OpcSession: Send + Sync {
    async fn browse(&self, node_id: &str) -> Result<BrowsePage, ProtocolError>;

    async fn browse_next(&self, continuation: &[u8]) -> Result<BrowsePage, ProtocolError>;

    /// 读取 Value 属性；结果与 `node_ids` 顺序一致
    async fn read_values(
        &self,
        node_ids: &[String],
    ) -> Result<Vec<Result<VariableValue, String>>, ProtocolError>;

    /// 读取 DataType 属性
    async fn read_data_types(
        &self,
        node_ids: &[String],
    ) -> Result<Vec<Option<String>>, ProtocolError>;

    async fn write_value(&self, node_id: &str, value: &VariableValue) -> Result<(), ProtocolError>;

    /// 返回 (订阅 id, 服务端修订后的发布间隔)
    async fn create_subscription(
        &self,
        publishing_interval_ms: u64,
    ) -> Result<(u32, u64), ProtocolError>;

    async fn modify_subscription(
        &self,
        subscription_id: u32,
        publishing_interval_ms: u64,
    ) -> Result<u64, ProtocolError>;

    async fn delete_subscription(&self, subscription_id: u32) -> Result<(), ProtocolError>;

    /// 一次批量创建监控项；逐项返回监控项 id 或失败原因
    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemSpec],
    ) -> Result<Vec<Result<u32, String>>, ProtocolError>;

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        item_ids: &[u32],
    ) -> Result<(), ProtocolError>;

    async fn close(&self) -> Result<(), ProtocolError>;
}

/// 建立会话后的三件套：会话、通知流、会话状态
pub struct OpcLink {
    pub session: Arc<dyn OpcSession>,
    pub changes: mpsc::UnboundedReceiver<DataChange>,
    pub status: watch::Receiver<SessionStatus>,
}

#[async_trait]
pub trait OpcConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &OpcEndpoint,
        timeout: Duration,
    ) -> Result<OpcLink, ProtocolError>;
}

/// 关闭 `opcua` 特性时的连接器，也用于测试：每次连接都失败，由管理器按退避重试
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableConnector;

#[async_trait]
impl OpcConnector for UnavailableConnector {
    async fn connect(
        &self,
        endpoint: &OpcEndpoint,
        _timeout: Duration,
    ) -> Result<OpcLink, ProtocolError> {
        Err(ProtocolError::Unsupported(format!(
            "opc ua client not compiled in (enable feature `opcua`), cannot reach {}",
            endpoint.server_url
        )))
    }
}
