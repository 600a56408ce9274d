//! 协议差异策略
//!
//! 共享的连接管理器只通过策略对象感知协议差异：数据获取方式与单次批量读取上限。

use crate::connection::SubscribeRequest;
use domain::{PollingInterval, Protocol};

/// 数据获取方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// 调度器按轮询组周期批量读取（PLC）
    Polled,
    /// 连接后按轮询周期建立订阅（OPC UA）
    Subscribed,
    /// 由对端推送（MQTT）
    Pushed,
}

pub trait ProtocolStrategy: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    fn mode(&self) -> AcquisitionMode;

    /// 单次批量读取的最大条目数
    fn max_read_batch(&self) -> usize {
        usize::MAX
    }

    fn subscribe_request(&self, address: &str, interval: PollingInterval) -> SubscribeRequest {
        SubscribeRequest {
            address: address.to_string(),
            publishing_interval_ms: interval.as_millis(),
            sampling_interval_ms: interval.as_millis(),
        }
    }
}

/// PLC：轮询，单次读取条目受 PDU 限制
#[derive(Debug, Clone, Copy)]
pub struct PlcStrategy {
    pub max_batch: usize,
}

impl Default for PlcStrategy {
    fn default() -> Self {
        Self { max_batch: 10 }
    }
}

impl ProtocolStrategy for PlcStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Plc
    }

    fn mode(&self) -> AcquisitionMode {
        AcquisitionMode::Polled
    }

    fn max_read_batch(&self) -> usize {
        self.max_batch.max(1)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpcStrategy;

impl ProtocolStrategy for OpcStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Opc
    }

    fn mode(&self) -> AcquisitionMode {
        AcquisitionMode::Subscribed
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MqttStrategy;

impl ProtocolStrategy for MqttStrategy {
    fn protocol(&self) -> Protocol {
        Protocol::Mqtt
    }

    fn mode(&self) -> AcquisitionMode {
        AcquisitionMode::Pushed
    }
}
