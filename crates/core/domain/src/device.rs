use std::fmt;

/// 设备标识（由目录分配）。
pub type DeviceId = i64;

/// 采集协议。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Plc,
    Opc,
    Mqtt,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Plc, Protocol::Opc, Protocol::Mqtt];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Plc => "plc",
            Protocol::Opc => "opc",
            Protocol::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 设备连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// PLC 端点（ISO-on-TCP）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlcEndpoint {
    pub ip: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
}

/// OPC UA 端点。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcEndpoint {
    pub server_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// MQTT Broker 端点。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub subscribe_topic: String,
    pub publish_topic: String,
}

/// 协议相关的端点配置，协议标签由端点类型决定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEndpoint {
    Plc(PlcEndpoint),
    Opc(OpcEndpoint),
    Mqtt(MqttEndpoint),
}

impl DeviceEndpoint {
    pub fn protocol(&self) -> Protocol {
        match self {
            DeviceEndpoint::Plc(_) => Protocol::Plc,
            DeviceEndpoint::Opc(_) => Protocol::Opc,
            DeviceEndpoint::Mqtt(_) => Protocol::Mqtt,
        }
    }
}

/// 设备定义（目录所有；连接状态只由所属连接管理器修改）。
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub endpoint: DeviceEndpoint,
    pub is_active: bool,
    pub connection_state: ConnectionState,
}

impl Device {
    pub fn protocol(&self) -> Protocol {
        self.endpoint.protocol()
    }
}
