#![allow(dead_code)]

use async_trait::async_trait;
use domain::{
    ConnectionState, Device, DeviceEndpoint, DeviceId, MqttEndpoint, OpcEndpoint, PlcEndpoint,
    PollingInterval, Protocol, Variable, VariableId, VariableValue,
};
use ems_pipeline::PendingOutboundMessage;
use ems_protocol::{
    ConnectionEvent, ConnectionEventSender, ConnectionFactory, DeviceConnection, ProtocolError,
    ReadOutcome, SubscribeRequest,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// 假设备的可观察状态（测试与连接共享）
#[derive(Default)]
pub struct FakeState {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_reads: AtomicBool,
    /// 每次读取耗时（毫秒），模拟慢设备
    pub read_delay_ms: AtomicU64,
    pub reads: Mutex<Vec<Vec<String>>>,
    pub writes: Mutex<Vec<(String, VariableValue)>>,
    pub subscribes: Mutex<Vec<Vec<SubscribeRequest>>>,
    pub unsubscribes: Mutex<Vec<Vec<String>>>,
    pub published: Mutex<Vec<PendingOutboundMessage>>,
    pub events: Mutex<Option<ConnectionEventSender>>,
}

impl FakeState {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn read_batches(&self) -> Vec<Vec<String>> {
        self.reads.lock().expect("reads").clone()
    }

    /// 模拟协议层主动上报
    pub fn push(&self, event: ConnectionEvent) {
        let events = self.events.lock().expect("events");
        events.as_ref().expect("sender").send(event).expect("send");
    }
}

pub struct FakeConnection {
    state: Arc<FakeState>,
    connected: bool,
}

#[async_trait]
impl DeviceConnection for FakeConnection {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection("refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read(&mut self, addresses: &[String]) -> Result<Vec<ReadOutcome>, ProtocolError> {
        let delay = self.state.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(ProtocolError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            )));
        }
        let mut reads = self.state.reads.lock().expect("reads");
        reads.push(addresses.to_vec());
        let n = reads.len() as i64;
        Ok(addresses
            .iter()
            .map(|address| ReadOutcome::ok(address.clone(), VariableValue::I64(n)))
            .collect())
    }

    async fn write(&mut self, address: &str, value: &VariableValue) -> Result<(), ProtocolError> {
        self.state
            .writes
            .lock()
            .expect("writes")
            .push((address.to_string(), value.clone()));
        Ok(())
    }

    async fn subscribe(&mut self, requests: &[SubscribeRequest]) -> Result<(), ProtocolError> {
        self.state
            .subscribes
            .lock()
            .expect("subscribes")
            .push(requests.to_vec());
        Ok(())
    }

    async fn unsubscribe(&mut self, addresses: &[String]) -> Result<(), ProtocolError> {
        self.state
            .unsubscribes
            .lock()
            .expect("unsubscribes")
            .push(addresses.to_vec());
        Ok(())
    }

    async fn publish(
        &mut self,
        messages: &[PendingOutboundMessage],
    ) -> Result<usize, ProtocolError> {
        self.state
            .published
            .lock()
            .expect("published")
            .extend_from_slice(messages);
        Ok(messages.len())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    states: Mutex<HashMap<DeviceId, Arc<FakeState>>>,
    pub created: AtomicUsize,
}

impl FakeFactory {
    pub fn state(&self, device_id: DeviceId) -> Arc<FakeState> {
        self.states
            .lock()
            .expect("states")
            .entry(device_id)
            .or_default()
            .clone()
    }
}

impl ConnectionFactory<FakeConnection> for FakeFactory {
    fn create(
        &self,
        device: &Device,
        events: ConnectionEventSender,
    ) -> Result<FakeConnection, ProtocolError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let state = self.state(device.id);
        *state.events.lock().expect("events") = Some(events);
        Ok(FakeConnection {
            state,
            connected: false,
        })
    }
}

pub fn plc_device(id: DeviceId, is_active: bool) -> Device {
    Device {
        id,
        name: format!("plc-{}", id),
        endpoint: DeviceEndpoint::Plc(PlcEndpoint {
            ip: "127.0.0.1".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
        }),
        is_active,
        connection_state: ConnectionState::Disconnected,
    }
}

pub fn opc_device(id: DeviceId) -> Device {
    Device {
        id,
        name: format!("opc-{}", id),
        endpoint: DeviceEndpoint::Opc(OpcEndpoint {
            server_url: "opc.tcp://127.0.0.1:4840".to_string(),
            username: None,
            password: None,
        }),
        is_active: true,
        connection_state: ConnectionState::Disconnected,
    }
}

pub fn mqtt_device(id: DeviceId) -> Device {
    Device {
        id,
        name: format!("broker-{}", id),
        endpoint: DeviceEndpoint::Mqtt(MqttEndpoint {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: String::new(),
            username: None,
            password: None,
            subscribe_topic: "in/#".to_string(),
            publish_topic: "out/values".to_string(),
        }),
        is_active: true,
        connection_state: ConnectionState::Disconnected,
    }
}

pub fn variable(
    id: VariableId,
    device_id: DeviceId,
    protocol: Protocol,
    address: &str,
    interval: PollingInterval,
) -> Variable {
    Variable {
        id,
        device_id,
        protocol,
        address: address.to_string(),
        polling_interval: interval,
        is_active: true,
        value: None,
        updated_at_ms: None,
        alarm_enabled: false,
        history_enabled: false,
        outbound: None,
    }
}
