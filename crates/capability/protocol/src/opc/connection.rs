//! OPC UA 设备连接
//!
//! 连接建立后启动一个通知泵：订阅通知经跟踪表过滤后转成 `ConnectionEvent::ValueChanged`，
//! 会话状态变为断开时上报 `ConnectionEvent::Disconnected`。

use crate::connection::{
    ConnectionEvent, ConnectionEventSender, ConnectionFactory, DeviceConnection, ReadOutcome,
    SubscribeRequest,
};
use crate::error::ProtocolError;
use crate::opc::browse::{BrowsedNode, browse_tree};
use crate::opc::session::{DataChange, OpcConnector, OpcLink, OpcSession, SessionStatus};
use crate::opc::subscription::SubscriptionEngine;
use async_trait::async_trait;
use domain::{Device, DeviceEndpoint, DeviceId, OpcEndpoint, VariableValue, now_epoch_ms};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 默认浏览深度
pub const DEFAULT_BROWSE_DEPTH: usize = 8;

pub struct OpcConnection {
    device_id: DeviceId,
    endpoint: OpcEndpoint,
    connector: Arc<dyn OpcConnector>,
    connect_timeout: Duration,
    events: ConnectionEventSender,
    session: Option<Arc<dyn OpcSession>>,
    engine: Arc<Mutex<SubscriptionEngine>>,
    pump: Option<JoinHandle<()>>,
}

impl OpcConnection {
    pub fn new(
        device_id: DeviceId,
        endpoint: OpcEndpoint,
        connector: Arc<dyn OpcConnector>,
        connect_timeout: Duration,
        events: ConnectionEventSender,
    ) -> Self {
        Self {
            device_id,
            endpoint,
            connector,
            connect_timeout,
            events,
            session: None,
            engine: Arc::new(Mutex::new(SubscriptionEngine::new())),
            pump: None,
        }
    }

    fn session(&self) -> Result<Arc<dyn OpcSession>, ProtocolError> {
        self.session
            .clone()
            .ok_or(ProtocolError::NotConnected(self.device_id))
    }

    /// 当前跟踪的监控项数量
    pub async fn tracked_count(&self) -> usize {
        self.engine.lock().await.tracked_count()
    }

    pub async fn subscription_count(&self) -> usize {
        self.engine.lock().await.subscription_count()
    }

    /// 从 `root` 递归浏览
    pub async fn browse(&self, root: &str) -> Result<Vec<BrowsedNode>, ProtocolError> {
        let session = self.session()?;
        browse_tree(session.as_ref(), root, DEFAULT_BROWSE_DEPTH).await
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    /// 读取新跟踪节点的当前值并作为数据变化上报
    async fn emit_initial_values(&self, session: &dyn OpcSession, node_ids: &[String]) {
        if node_ids.is_empty() {
            return;
        }
        match session.read_values(node_ids).await {
            Ok(values) => {
                let ts_ms = now_epoch_ms();
                for (node_id, value) in node_ids.iter().zip(values) {
                    if let Ok(value) = value {
                        let _ = self.events.send(ConnectionEvent::ValueChanged {
                            address: node_id.clone(),
                            value,
                            ts_ms,
                        });
                    }
                }
            }
            Err(err) => warn!(
                target: "ems.opc",
                device_id = %self.device_id,
                error = %err,
                "initial_value_read_failed"
            ),
        }
    }
}

async fn notification_pump(
    device_id: DeviceId,
    mut changes: mpsc::UnboundedReceiver<DataChange>,
    mut status: watch::Receiver<SessionStatus>,
    engine: Arc<Mutex<SubscriptionEngine>>,
    events: ConnectionEventSender,
) {
    loop {
        tokio::select! {
            change = changes.recv() => {
                let Some(change) = change else {
                    let _ = events.send(ConnectionEvent::Disconnected {
                        reason: "notification stream closed".to_string(),
                    });
                    return;
                };
                if !engine.lock().await.is_tracked(&change.node_id) {
                    debug!(
                        target: "ems.opc",
                        device_id = %device_id,
                        node_id = %change.node_id,
                        "untracked_notification_dropped"
                    );
                    continue;
                }
                if events
                    .send(ConnectionEvent::ValueChanged {
                        address: change.node_id,
                        value: change.value,
                        ts_ms: change.ts_ms,
                    })
                    .is_err()
                {
                    return;
                }
            }
            changed = status.changed() => {
                let reason = match changed {
                    Err(_) => "session status channel closed".to_string(),
                    Ok(()) => match &*status.borrow_and_update() {
                        SessionStatus::Connected => continue,
                        SessionStatus::Disconnected(reason) => reason.clone(),
                    },
                };
                let _ = events.send(ConnectionEvent::Disconnected { reason });
                return;
            }
        }
    }
}

#[async_trait]
impl DeviceConnection for OpcConnection {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.session.is_some() {
            return Ok(());
        }
        let OpcLink {
            session,
            changes,
            status,
        } = self
            .connector
            .connect(&self.endpoint, self.connect_timeout)
            .await?;

        self.engine.lock().await.clear();
        self.pump = Some(tokio::spawn(notification_pump(
            self.device_id,
            changes,
            status,
            self.engine.clone(),
            self.events.clone(),
        )));
        self.session = Some(session);
        info!(
            target: "ems.opc",
            device_id = %self.device_id,
            server_url = %self.endpoint.server_url,
            "opc_session_opened"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        self.stop_pump();
        self.engine.lock().await.clear();
        if let Some(session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn read(&mut self, addresses: &[String]) -> Result<Vec<ReadOutcome>, ProtocolError> {
        let session = self.session()?;
        let values = session.read_values(addresses).await?;
        Ok(addresses
            .iter()
            .zip(values)
            .map(|(address, result)| ReadOutcome {
                address: address.clone(),
                result,
            })
            .collect())
    }

    async fn write(&mut self, address: &str, value: &VariableValue) -> Result<(), ProtocolError> {
        self.session()?.write_value(address, value).await
    }

    async fn subscribe(&mut self, requests: &[SubscribeRequest]) -> Result<(), ProtocolError> {
        let session = self.session()?;
        let mut grouped: BTreeMap<(u64, u64), Vec<String>> = BTreeMap::new();
        for request in requests {
            grouped
                .entry((request.publishing_interval_ms, request.sampling_interval_ms))
                .or_default()
                .push(request.address.clone());
        }

        let mut added = Vec::new();
        {
            let mut engine = self.engine.lock().await;
            for ((publishing_ms, sampling_ms), nodes) in grouped {
                match engine
                    .subscribe(session.as_ref(), &nodes, publishing_ms, sampling_ms)
                    .await
                {
                    Ok(nodes) => added.extend(nodes),
                    // 单个间隔失败不影响其他间隔
                    Err(err) => warn!(
                        target: "ems.opc",
                        device_id = %self.device_id,
                        publishing_ms,
                        error = %err,
                        "subscription_setup_failed"
                    ),
                }
            }
        }
        debug!(
            target: "ems.opc",
            device_id = %self.device_id,
            added = added.len(),
            "monitored_items_added"
        );
        self.emit_initial_values(session.as_ref(), &added).await;
        Ok(())
    }

    async fn unsubscribe(&mut self, addresses: &[String]) -> Result<(), ProtocolError> {
        let session = self.session()?;
        let removed = self
            .engine
            .lock()
            .await
            .unsubscribe(session.as_ref(), addresses)
            .await?;
        debug!(
            target: "ems.opc",
            device_id = %self.device_id,
            removed,
            "monitored_items_removed"
        );
        Ok(())
    }
}

impl Drop for OpcConnection {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// 按设备端点构造 OPC 连接
#[derive(Clone)]
pub struct OpcConnectionFactory {
    connector: Arc<dyn OpcConnector>,
    connect_timeout: Duration,
}

impl OpcConnectionFactory {
    pub fn new(connector: Arc<dyn OpcConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }
}

impl ConnectionFactory<OpcConnection> for OpcConnectionFactory {
    fn create(
        &self,
        device: &Device,
        events: ConnectionEventSender,
    ) -> Result<OpcConnection, ProtocolError> {
        match &device.endpoint {
            DeviceEndpoint::Opc(endpoint) => Ok(OpcConnection::new(
                device.id,
                endpoint.clone(),
                self.connector.clone(),
                self.connect_timeout,
                events,
            )),
            other => Err(ProtocolError::Unsupported(format!(
                "opc factory cannot build {} device {}",
                other.protocol(),
                device.id
            ))),
        }
    }
}
