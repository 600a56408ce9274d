//! 采集引擎的领域模型：设备、变量、轮询周期与引擎事件。
//!
//! 该 crate 不依赖任何外部库；目录记录与领域模型之间的转换在 `ems-storage` 中显式完成。

pub mod data;
pub mod device;
pub mod event;
pub mod variable;

pub use data::{VariableValue, now_epoch_ms};
pub use device::{
    ConnectionState, Device, DeviceEndpoint, DeviceId, MqttEndpoint, OpcEndpoint, PlcEndpoint,
    Protocol,
};
pub use event::EngineEvent;
pub use variable::{OutboundBinding, PollingInterval, Variable, VariableId};
