use crate::data::VariableValue;
use crate::device::{DeviceId, Protocol};
use std::time::Duration;

/// 变量标识（由目录分配）。
pub type VariableId = i64;

/// 标准轮询周期。声明顺序即周期由短到长，`Ord` 依赖该顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PollingInterval {
    Ms10,
    Ms100,
    Ms500,
    Sec1,
    Sec5,
    Sec10,
    Sec20,
    Sec30,
    Min1,
    Min3,
    Min5,
    Min10,
    Min30,
}

impl PollingInterval {
    pub const ALL: [PollingInterval; 13] = [
        PollingInterval::Ms10,
        PollingInterval::Ms100,
        PollingInterval::Ms500,
        PollingInterval::Sec1,
        PollingInterval::Sec5,
        PollingInterval::Sec10,
        PollingInterval::Sec20,
        PollingInterval::Sec30,
        PollingInterval::Min1,
        PollingInterval::Min3,
        PollingInterval::Min5,
        PollingInterval::Min10,
        PollingInterval::Min30,
    ];

    pub fn as_millis(&self) -> u64 {
        match self {
            PollingInterval::Ms10 => 10,
            PollingInterval::Ms100 => 100,
            PollingInterval::Ms500 => 500,
            PollingInterval::Sec1 => 1_000,
            PollingInterval::Sec5 => 5_000,
            PollingInterval::Sec10 => 10_000,
            PollingInterval::Sec20 => 20_000,
            PollingInterval::Sec30 => 30_000,
            PollingInterval::Min1 => 60_000,
            PollingInterval::Min3 => 180_000,
            PollingInterval::Min5 => 300_000,
            PollingInterval::Min10 => 600_000,
            PollingInterval::Min30 => 1_800_000,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.as_millis())
    }

    /// 只接受标准周期集合中的值。
    pub fn from_millis(ms: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|interval| interval.as_millis() == ms)
    }
}

/// 变量到 MQTT 外发别名的绑定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBinding {
    pub broker_id: DeviceId,
    pub alias: String,
}

/// 变量定义与最新值。
///
/// `value` / `updated_at_ms` 只由数据处理流水线的写入阶段修改。
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub id: VariableId,
    pub device_id: DeviceId,
    pub protocol: Protocol,
    /// PLC 地址、OPC 节点标识或 MQTT 别名。
    pub address: String,
    pub polling_interval: PollingInterval,
    pub is_active: bool,
    pub value: Option<VariableValue>,
    pub updated_at_ms: Option<i64>,
    pub alarm_enabled: bool,
    pub history_enabled: bool,
    pub outbound: Option<OutboundBinding>,
}
