//! # 协议通信能力模块
//!
//! 三种设备协议共用一个泛型连接管理器，协议差异由策略对象和连接实现承担：
//! - **PLC**：S7 over ISO-on-TCP，调度器按轮询组批量读取
//! - **OPC UA**：连接后按轮询周期建立订阅，通知推送数据
//! - **MQTT**：Broker 推送入站数据，同时承担外发发布
//!
//! ## 架构设计
//!
//! ```text
//! VariableCatalog (设备 / 变量定义)
//!       │
//!       ▼
//! ProtocolConnectionManager<C: DeviceConnection>
//!       │   ├── DeviceContext (连接、轮询组、重连状态)
//!       │   ├── 连接许可 (Semaphore)
//!       │   └── 重连调度 (ReconnectPolicy)
//!       │
//!       ├── PollingScheduler ── PlcConnection ── S7Client
//!       ├── OpcConnection ── SubscriptionEngine ── OpcSession
//!       └── MqttConnection ── OutboundPublisher
//!       │
//!       ▼
//! ValueSender → DataProcessingPipeline
//! ```
//!
//! ## 连接事件
//!
//! 连接对象不注册回调，而是持有一个事件发送端：
//! 数据变化与断线都作为 `ConnectionEvent` 交给管理器的事件泵处理。

pub mod connection;
pub mod error;
pub mod manager;
pub mod mqtt;
pub mod opc;
pub mod plc;
pub mod poll_group;
pub mod reconnect;
pub mod scheduler;
pub mod strategy;

pub use connection::{
    ConnectionEvent, ConnectionEventReceiver, ConnectionEventSender, ConnectionFactory,
    DeviceConnection, ReadOutcome, SubscribeRequest,
};
pub use error::ProtocolError;
pub use manager::{
    DeviceContext, DevicePollReport, ManagerConfig, ManagerHooks, ProtocolConnectionManager,
};
pub use mqtt::{
    MqttConnection, MqttConnectionFactory, OutboundPublisher, OutboundSink, PublishReport,
    PublisherConfig,
};
pub use opc::{OpcConnection, OpcConnectionFactory, OpcConnector, OpcSession, SubscriptionEngine};
pub use plc::{PlcConnection, PlcConnectionFactory};
pub use poll_group::{PollGroups, VariableSet};
pub use reconnect::{ReconnectPolicy, ReconnectState};
pub use scheduler::{PollingScheduler, SchedulerConfig, SweepReport};
pub use strategy::{AcquisitionMode, MqttStrategy, OpcStrategy, PlcStrategy, ProtocolStrategy};

/// PLC 连接管理器
pub type PlcManager = ProtocolConnectionManager<PlcConnection>;
/// OPC UA 连接管理器
pub type OpcManager = ProtocolConnectionManager<OpcConnection>;
/// MQTT 连接管理器
pub type MqttManager = ProtocolConnectionManager<MqttConnection>;
