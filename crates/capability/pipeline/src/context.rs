use domain::{DeviceId, Variable, VariableId, VariableValue};

/// 流水线中流转的一次观测值。
///
/// `handled` 置位后后续处理器不再执行；`modified` 只由变化检测阶段置位。
#[derive(Debug, Clone)]
pub struct ValueContext {
    pub variable_id: VariableId,
    pub device_id: DeviceId,
    pub value: VariableValue,
    pub ts_ms: i64,
    /// 写入阶段之后为写入后的变量快照，之前为目录中的当前快照
    pub variable: Option<Variable>,
    pub modified: bool,
    pub handled: bool,
    pub reason: Option<String>,
}

impl ValueContext {
    pub fn new(
        variable_id: VariableId,
        device_id: DeviceId,
        value: VariableValue,
        ts_ms: i64,
    ) -> Self {
        Self {
            variable_id,
            device_id,
            value,
            ts_ms,
            variable: None,
            modified: false,
            handled: false,
            reason: None,
        }
    }

    /// 标记已处理（短路后续处理器）
    pub fn short_circuit(&mut self, reason: impl Into<String>) {
        self.handled = true;
        self.reason = Some(reason.into());
    }
}
