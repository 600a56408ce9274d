//! 目录文件数据模型与显式转换
//!
//! 记录结构与文件格式一一对应（camelCase），转换函数负责校验协议端点字段与轮询周期集合。

use crate::error::StorageError;
use domain::{
    ConnectionState, Device, DeviceEndpoint, DeviceId, MqttEndpoint, OpcEndpoint,
    OutboundBinding, PlcEndpoint, PollingInterval, Protocol, Variable,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 目录文件根结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub variables: Vec<VariableRecord>,
}

/// 设备记录（扁平端点字段，按协议取用）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub protocol: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub rack: Option<u16>,
    pub slot: Option<u16>,
    pub server_url: Option<String>,
    pub host: Option<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub subscribe_topic: Option<String>,
    pub publish_topic: Option<String>,
}

/// 变量记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableRecord {
    pub id: i64,
    pub device_id: DeviceId,
    pub protocol: Option<String>,
    pub address: String,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub alarm_enabled: bool,
    #[serde(default)]
    pub history_enabled: bool,
    pub outbound_broker_id: Option<DeviceId>,
    pub outbound_alias: Option<String>,
}

/// 转换后的目录快照
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub devices: Vec<Device>,
    pub variables: Vec<Variable>,
}

fn default_true() -> bool {
    true
}

fn default_polling_interval_ms() -> u64 {
    1_000
}

/// 解析协议标签
pub fn parse_protocol(tag: &str) -> Result<Protocol, StorageError> {
    match tag.trim().to_ascii_lowercase().as_str() {
        "plc" | "s7" => Ok(Protocol::Plc),
        "opc" | "opcua" | "opc_ua" => Ok(Protocol::Opc),
        "mqtt" => Ok(Protocol::Mqtt),
        other => Err(StorageError::new(format!("unknown protocol: {}", other))),
    }
}

fn required<T>(value: Option<T>, device_id: DeviceId, field: &str) -> Result<T, StorageError> {
    value.ok_or_else(|| {
        StorageError::new(format!("device {}: missing field {}", device_id, field))
    })
}

/// DeviceRecord -> Device
pub fn device_from_record(record: DeviceRecord) -> Result<Device, StorageError> {
    let protocol = parse_protocol(&record.protocol)?;
    let id = record.id;
    let endpoint = match protocol {
        Protocol::Plc => DeviceEndpoint::Plc(PlcEndpoint {
            ip: required(record.ip, id, "ip")?,
            port: record.port.unwrap_or(102),
            rack: record.rack.unwrap_or(0),
            slot: record.slot.unwrap_or(1),
        }),
        Protocol::Opc => DeviceEndpoint::Opc(OpcEndpoint {
            server_url: required(record.server_url, id, "serverUrl")?,
            username: record.username,
            password: record.password,
        }),
        Protocol::Mqtt => DeviceEndpoint::Mqtt(MqttEndpoint {
            host: required(record.host, id, "host")?,
            port: record.port.unwrap_or(1883),
            client_id: record.client_id.unwrap_or_default(),
            username: record.username,
            password: record.password,
            subscribe_topic: required(record.subscribe_topic, id, "subscribeTopic")?,
            publish_topic: required(record.publish_topic, id, "publishTopic")?,
        }),
    };
    Ok(Device {
        id,
        name: record.name,
        endpoint,
        is_active: record.is_active,
        connection_state: ConnectionState::Disconnected,
    })
}

/// VariableRecord -> Variable（协议取自所属设备）
pub fn variable_from_record(
    record: VariableRecord,
    devices: &HashMap<DeviceId, Protocol>,
) -> Result<Variable, StorageError> {
    let protocol = devices.get(&record.device_id).copied().ok_or_else(|| {
        StorageError::new(format!(
            "variable {}: unknown device {}",
            record.id, record.device_id
        ))
    })?;
    if let Some(tag) = record.protocol.as_deref() {
        if parse_protocol(tag)? != protocol {
            return Err(StorageError::new(format!(
                "variable {}: protocol {} does not match device {}",
                record.id, tag, record.device_id
            )));
        }
    }
    let polling_interval =
        PollingInterval::from_millis(record.polling_interval_ms).ok_or_else(|| {
            StorageError::new(format!(
                "variable {}: unsupported polling interval {}ms",
                record.id, record.polling_interval_ms
            ))
        })?;
    if record.address.trim().is_empty() {
        return Err(StorageError::new(format!(
            "variable {}: empty address",
            record.id
        )));
    }
    let outbound = match (record.outbound_broker_id, record.outbound_alias) {
        (Some(broker_id), Some(alias)) if !alias.is_empty() => {
            Some(OutboundBinding { broker_id, alias })
        }
        (None, None) => None,
        _ => {
            return Err(StorageError::new(format!(
                "variable {}: outboundBrokerId and outboundAlias must be set together",
                record.id
            )));
        }
    };
    Ok(Variable {
        id: record.id,
        device_id: record.device_id,
        protocol,
        address: record.address.trim().to_string(),
        polling_interval,
        is_active: record.is_active,
        value: None,
        updated_at_ms: None,
        alarm_enabled: record.alarm_enabled,
        history_enabled: record.history_enabled,
        outbound,
    })
}

/// CatalogFile -> CatalogSnapshot
pub fn snapshot_from_file(file: CatalogFile) -> Result<CatalogSnapshot, StorageError> {
    let mut devices = Vec::with_capacity(file.devices.len());
    let mut protocols = HashMap::new();
    for record in file.devices {
        let device = device_from_record(record)?;
        if protocols.insert(device.id, device.protocol()).is_some() {
            return Err(StorageError::new(format!("duplicate device id {}", device.id)));
        }
        devices.push(device);
    }
    let mut variables = Vec::with_capacity(file.variables.len());
    let mut seen = std::collections::HashSet::new();
    for record in file.variables {
        let variable = variable_from_record(record, &protocols)?;
        if !seen.insert(variable.id) {
            return Err(StorageError::new(format!(
                "duplicate variable id {}",
                variable.id
            )));
        }
        variables.push(variable);
    }
    Ok(CatalogSnapshot { devices, variables })
}
