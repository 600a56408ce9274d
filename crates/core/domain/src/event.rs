use crate::data::VariableValue;
use crate::device::{ConnectionState, DeviceId, Protocol};
use crate::variable::VariableId;

/// 引擎对外事件（界面与历史订阅者消费）。
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ConnectionStateChanged {
        device_id: DeviceId,
        protocol: Protocol,
        state: ConnectionState,
        connected: bool,
    },
    ValueChanged {
        variable_id: VariableId,
        value: VariableValue,
        ts_ms: i64,
    },
}
