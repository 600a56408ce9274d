//! MQTT Broker 连接
//!
//! 一个 Broker 设备即一个 MQTT 客户端：订阅入站主题接收推送值，
//! 同时承担外发消息的发布。所有发布使用 QoS 0。

use crate::connection::{
    ConnectionEvent, ConnectionEventSender, ConnectionFactory, DeviceConnection, ReadOutcome,
};
use crate::error::ProtocolError;
use crate::mqtt::payload::parse_inbound;
use async_trait::async_trait;
use domain::{Device, DeviceEndpoint, DeviceId, MqttEndpoint, VariableValue, now_epoch_ms};
use ems_pipeline::{PendingOutboundMessage, encode_payload};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub struct MqttConnection {
    device_id: DeviceId,
    endpoint: MqttEndpoint,
    connect_timeout: Duration,
    events: ConnectionEventSender,
    client: Option<AsyncClient>,
    pump: Option<JoinHandle<()>>,
}

impl MqttConnection {
    pub fn new(
        device_id: DeviceId,
        endpoint: MqttEndpoint,
        connect_timeout: Duration,
        events: ConnectionEventSender,
    ) -> Self {
        Self {
            device_id,
            endpoint,
            connect_timeout,
            events,
            client: None,
            pump: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = if self.endpoint.client_id.trim().is_empty() {
            format!("ems-{}", uuid::Uuid::new_v4())
        } else {
            self.endpoint.client_id.clone()
        };
        let mut options = MqttOptions::new(client_id, self.endpoint.host.clone(), self.endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) =
            (self.endpoint.username.as_ref(), self.endpoint.password.as_ref())
        {
            options.set_credentials(username, password);
        }
        options
    }

    fn client(&self) -> Result<&AsyncClient, ProtocolError> {
        self.client
            .as_ref()
            .ok_or(ProtocolError::NotConnected(self.device_id))
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// 等待 ConnAck
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ProtocolError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(ProtocolError::Connection(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => {}
            Err(err) => return Err(ProtocolError::Connection(err.to_string())),
        }
    }
}

/// 入站泵：推送值转成连接事件；任何连接错误都上报断线并退出
async fn inbound_pump(device_id: DeviceId, mut eventloop: EventLoop, events: ConnectionEventSender) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let values = match parse_inbound(&publish.topic, &publish.payload, now_epoch_ms()) {
                    Ok(values) => values,
                    Err(err) => {
                        warn!(
                            target: "ems.mqtt",
                            device_id,
                            topic = %publish.topic,
                            error = %err,
                            "inbound_payload_skipped"
                        );
                        continue;
                    }
                };
                for inbound in values {
                    let event = ConnectionEvent::ValueChanged {
                        address: inbound.alias,
                        value: inbound.value,
                        ts_ms: inbound.ts_ms,
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(ConnectionEvent::Disconnected {
                    reason: "broker sent disconnect".to_string(),
                });
                return;
            }
            Ok(_) => {}
            Err(err) => {
                let _ = events.send(ConnectionEvent::Disconnected {
                    reason: err.to_string(),
                });
                return;
            }
        }
    }
}

#[async_trait]
impl DeviceConnection for MqttConnection {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.client.is_some() {
            return Ok(());
        }
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);
        tokio::time::timeout(self.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| {
                ProtocolError::Timeout(format!(
                    "connack from {}:{}",
                    self.endpoint.host, self.endpoint.port
                ))
            })??;

        if !self.endpoint.subscribe_topic.is_empty() {
            client
                .subscribe(self.endpoint.subscribe_topic.clone(), QoS::AtMostOnce)
                .await
                .map_err(|err| ProtocolError::Mqtt(err.to_string()))?;
        }
        self.pump = Some(tokio::spawn(inbound_pump(
            self.device_id,
            eventloop,
            self.events.clone(),
        )));
        self.client = Some(client);
        info!(
            target: "ems.mqtt",
            device_id = self.device_id,
            host = %self.endpoint.host,
            port = self.endpoint.port,
            topic = %self.endpoint.subscribe_topic,
            "broker_connected"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if let Some(client) = self.client.take() {
            // 事件循环已退出时 disconnect 请求会失败，忽略即可
            let _ = client.try_disconnect();
        }
        self.stop_pump();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn read(&mut self, addresses: &[String]) -> Result<Vec<ReadOutcome>, ProtocolError> {
        Ok(addresses
            .iter()
            .map(|address| ReadOutcome::failed(address.clone(), "mqtt values are pushed"))
            .collect())
    }

    /// 写入即向本 Broker 的发布主题发送一条别名消息
    async fn write(&mut self, address: &str, value: &VariableValue) -> Result<(), ProtocolError> {
        if self.endpoint.publish_topic.is_empty() {
            return Err(ProtocolError::Unsupported(format!(
                "broker {} has no publish topic",
                self.device_id
            )));
        }
        let payload = encode_payload(address, value, now_epoch_ms());
        self.client()?
            .publish(
                self.endpoint.publish_topic.clone(),
                QoS::AtMostOnce,
                false,
                payload,
            )
            .await
            .map_err(|err| ProtocolError::Connection(err.to_string()))
    }

    async fn publish(
        &mut self,
        messages: &[PendingOutboundMessage],
    ) -> Result<usize, ProtocolError> {
        let client = self.client()?;
        let mut published = 0;
        for message in messages {
            client
                .publish(
                    message.topic.clone(),
                    QoS::AtMostOnce,
                    false,
                    message.payload.clone(),
                )
                .await
                .map_err(|err| ProtocolError::Connection(err.to_string()))?;
            published += 1;
        }
        debug!(
            target: "ems.mqtt",
            device_id = self.device_id,
            published,
            "outbound_messages_published"
        );
        Ok(published)
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[derive(Debug, Clone)]
pub struct MqttConnectionFactory {
    pub connect_timeout: Duration,
}

impl MqttConnectionFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ConnectionFactory<MqttConnection> for MqttConnectionFactory {
    fn create(
        &self,
        device: &Device,
        events: ConnectionEventSender,
    ) -> Result<MqttConnection, ProtocolError> {
        match &device.endpoint {
            DeviceEndpoint::Mqtt(endpoint) => Ok(MqttConnection::new(
                device.id,
                endpoint.clone(),
                self.connect_timeout,
                events,
            )),
            other => Err(ProtocolError::Unsupported(format!(
                "mqtt factory cannot build {} device {}",
                other.protocol(),
                device.id
            ))),
        }
    }
}
