//! 设备连接抽象
//!
//! 每个 DeviceConnection 持有一个事件发送端，协议层的数据变化与断线通知通过它
//! 交给所属管理器的事件泵，管理器不在连接对象上注册回调。

use crate::error::ProtocolError;
use async_trait::async_trait;
use domain::{Device, VariableValue};
use ems_pipeline::PendingOutboundMessage;
use tokio::sync::mpsc;

/// 连接主动上报的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// 订阅/推送得到的新值（address 为变量地址：节点标识或 MQTT 别名）
    ValueChanged {
        address: String,
        value: VariableValue,
        ts_ms: i64,
    },
    /// 协议层检测到连接断开
    Disconnected { reason: String },
}

pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;
pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// 单个地址的读取结果
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub address: String,
    pub result: Result<VariableValue, String>,
}

impl ReadOutcome {
    pub fn ok(address: impl Into<String>, value: VariableValue) -> Self {
        Self {
            address: address.into(),
            result: Ok(value),
        }
    }

    pub fn failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            result: Err(reason.into()),
        }
    }
}

/// 订阅请求（一个地址一条）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub address: String,
    pub publishing_interval_ms: u64,
    pub sampling_interval_ms: u64,
}

/// 设备连接能力集合：连接、断开、读、写、订阅
#[async_trait]
pub trait DeviceConnection: Send + 'static {
    async fn connect(&mut self) -> Result<(), ProtocolError>;

    async fn disconnect(&mut self) -> Result<(), ProtocolError>;

    fn is_connected(&self) -> bool;

    /// 一次往返批量读取；结果与 `addresses` 顺序一致
    async fn read(&mut self, addresses: &[String]) -> Result<Vec<ReadOutcome>, ProtocolError>;

    async fn write(&mut self, address: &str, value: &VariableValue) -> Result<(), ProtocolError>;

    async fn subscribe(&mut self, _requests: &[SubscribeRequest]) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn unsubscribe(&mut self, _addresses: &[String]) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// 发布外发消息，返回成功条数
    async fn publish(
        &mut self,
        _messages: &[PendingOutboundMessage],
    ) -> Result<usize, ProtocolError> {
        Err(ProtocolError::Unsupported("publish".to_string()))
    }
}

/// 按设备构造连接对象
pub trait ConnectionFactory<C: DeviceConnection>: Send + Sync {
    fn create(&self, device: &Device, events: ConnectionEventSender) -> Result<C, ProtocolError>;
}
