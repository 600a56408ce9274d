//! PLC 设备连接
//!
//! PLC 只被轮询，不产生主动事件；断线由读写错误反映给管理器。

use crate::connection::{
    ConnectionEventSender, ConnectionFactory, DeviceConnection, ReadOutcome,
};
use crate::error::ProtocolError;
use crate::plc::address::{PlcAddress, parse_address};
use crate::plc::client::S7Client;
use async_trait::async_trait;
use domain::{Device, DeviceEndpoint, DeviceId, PlcEndpoint, VariableValue};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub struct PlcConnection {
    device_id: DeviceId,
    endpoint: PlcEndpoint,
    request_timeout: Duration,
    client: Option<S7Client<TcpStream>>,
    /// 地址字符串 -> 解析结果
    addresses: HashMap<String, Result<PlcAddress, String>>,
}

impl PlcConnection {
    pub fn new(
        device_id: DeviceId,
        endpoint: PlcEndpoint,
        request_timeout: Duration,
    ) -> Self {
        Self {
            device_id,
            endpoint,
            request_timeout,
            client: None,
            addresses: HashMap::new(),
        }
    }

    fn resolve(&mut self, raw: &str) -> Result<PlcAddress, String> {
        self.addresses
            .entry(raw.to_string())
            .or_insert_with(|| parse_address(raw).map_err(|err| err.to_string()))
            .clone()
    }

    fn drop_client(&mut self, reason: &str) {
        if self.client.take().is_some() {
            warn!(
                target: "ems.plc",
                device_id = %self.device_id,
                reason,
                "plc_connection_lost"
            );
        }
    }

    fn client(&mut self) -> Result<&mut S7Client<TcpStream>, ProtocolError> {
        self.client
            .as_mut()
            .ok_or(ProtocolError::NotConnected(self.device_id))
    }
}

#[async_trait]
impl DeviceConnection for PlcConnection {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.client.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.endpoint.ip, self.endpoint.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| ProtocolError::Connection(format!("{}: {}", addr, err)))?;
        stream.set_nodelay(true)?;
        let client = S7Client::handshake(
            stream,
            self.endpoint.rack,
            self.endpoint.slot,
            self.request_timeout,
        )
        .await?;
        debug!(
            target: "ems.plc",
            device_id = %self.device_id,
            addr = %addr,
            pdu_size = client.pdu_size(),
            "plc_connected"
        );
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if let Some(client) = self.client.take() {
            client.close().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn read(&mut self, addresses: &[String]) -> Result<Vec<ReadOutcome>, ProtocolError> {
        let mut outcomes: Vec<Option<ReadOutcome>> = Vec::with_capacity(addresses.len());
        let mut items = Vec::new();
        let mut slots = Vec::new();
        for (index, raw) in addresses.iter().enumerate() {
            match self.resolve(raw) {
                Ok(address) => {
                    items.push(address);
                    slots.push(index);
                    outcomes.push(None);
                }
                Err(reason) => outcomes.push(Some(ReadOutcome::failed(raw.clone(), reason))),
            }
        }

        if !items.is_empty() {
            let result = self.client()?.read_items(&items).await;
            let values = match result {
                Ok(values) => values,
                Err(err) => {
                    if err.is_connection_loss() {
                        self.drop_client(&err.to_string());
                    }
                    return Err(err);
                }
            };
            for (slot, value) in slots.into_iter().zip(values) {
                outcomes[slot] = Some(ReadOutcome {
                    address: addresses[slot].clone(),
                    result: value,
                });
            }
        }

        Ok(outcomes
            .into_iter()
            .zip(addresses)
            .map(|(outcome, raw)| {
                outcome.unwrap_or_else(|| ReadOutcome::failed(raw.clone(), "missing item"))
            })
            .collect())
    }

    async fn write(&mut self, address: &str, value: &VariableValue) -> Result<(), ProtocolError> {
        let address = self.resolve(address).map_err(ProtocolError::Address)?;
        let result = self.client()?.write_item(&address, value).await;
        if let Err(err) = &result {
            if err.is_connection_loss() {
                self.drop_client(&err.to_string());
            }
        }
        result
    }
}

/// 按设备端点构造 PLC 连接
#[derive(Debug, Clone)]
pub struct PlcConnectionFactory {
    pub request_timeout: Duration,
}

impl PlcConnectionFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl ConnectionFactory<PlcConnection> for PlcConnectionFactory {
    fn create(
        &self,
        device: &Device,
        _events: ConnectionEventSender,
    ) -> Result<PlcConnection, ProtocolError> {
        match &device.endpoint {
            DeviceEndpoint::Plc(endpoint) => Ok(PlcConnection::new(
                device.id,
                endpoint.clone(),
                self.request_timeout,
            )),
            other => Err(ProtocolError::Unsupported(format!(
                "plc factory cannot build {} device {}",
                other.protocol(),
                device.id
            ))),
        }
    }
}
