//! 外发发布循环
//!
//! 单一消费者：队列有数据或定时器到点时取出至多一批消息，按 Broker 分组后以 QoS 0 发布。
//! 未连接 Broker 的分组直接丢弃，不重试。

use crate::connection::DeviceConnection;
use crate::error::ProtocolError;
use crate::manager::ProtocolConnectionManager;
use async_trait::async_trait;
use domain::DeviceId;
use ems_pipeline::{OutboundReceiver, PendingOutboundMessage};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// 发布目标
#[async_trait]
pub trait OutboundSink: Send + Sync {
    fn is_connected(&self, broker_id: DeviceId) -> bool;

    async fn publish(
        &self,
        broker_id: DeviceId,
        messages: &[PendingOutboundMessage],
    ) -> Result<usize, ProtocolError>;
}

#[async_trait]
impl<C: DeviceConnection> OutboundSink for ProtocolConnectionManager<C> {
    fn is_connected(&self, broker_id: DeviceId) -> bool {
        ProtocolConnectionManager::is_connected(self, broker_id)
    }

    async fn publish(
        &self,
        broker_id: DeviceId,
        messages: &[PendingOutboundMessage],
    ) -> Result<usize, ProtocolError> {
        ProtocolConnectionManager::publish(self, broker_id, messages).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub cooldown: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
            cooldown: Duration::from_secs(5),
        }
    }
}

/// 一批发布的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub dropped: usize,
}

pub struct OutboundPublisher {
    sink: Arc<dyn OutboundSink>,
    config: PublisherConfig,
}

impl OutboundPublisher {
    pub fn new(sink: Arc<dyn OutboundSink>, config: PublisherConfig) -> Self {
        Self { sink, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// 按 Broker 分组发布一批消息
    pub async fn publish_batch(&self, batch: Vec<PendingOutboundMessage>) -> PublishReport {
        let mut groups: BTreeMap<DeviceId, Vec<PendingOutboundMessage>> = BTreeMap::new();
        for message in batch {
            groups.entry(message.broker_id).or_default().push(message);
        }

        let mut report = PublishReport::default();
        for (broker_id, messages) in groups {
            if !self.sink.is_connected(broker_id) {
                warn!(
                    target: "ems.mqtt",
                    broker_id,
                    count = messages.len(),
                    "outbound_group_dropped"
                );
                report.dropped += messages.len();
                continue;
            }
            match self.sink.publish(broker_id, &messages).await {
                Ok(published) => {
                    let published = published.min(messages.len());
                    report.published += published;
                    report.dropped += messages.len() - published;
                }
                Err(err) => {
                    warn!(
                        target: "ems.mqtt",
                        broker_id,
                        count = messages.len(),
                        error = %err,
                        "outbound_group_publish_failed"
                    );
                    report.dropped += messages.len();
                }
            }
        }
        ems_telemetry::record_outbound_published_n(report.published as u64);
        ems_telemetry::record_outbound_dropped_n(report.dropped as u64);
        report
    }

    fn fill(&self, receiver: &mut OutboundReceiver, batch: &mut Vec<PendingOutboundMessage>) {
        while batch.len() < self.config.batch_size {
            match receiver.try_recv() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
    }

    /// 发布一批；异常被捕获后冷却再继续
    async fn flush(&self, batch: Vec<PendingOutboundMessage>) {
        if batch.is_empty() {
            return;
        }
        let result = AssertUnwindSafe(self.publish_batch(batch))
            .catch_unwind()
            .await;
        if result.is_err() {
            ems_telemetry::record_loop_faults();
            error!(
                target: "ems.mqtt",
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "outbound_publisher_fault"
            );
            tokio::time::sleep(self.config.cooldown).await;
        }
    }

    /// 发布循环：数据或定时器先到者触发；关闭时发完队列中剩余消息后退出
    pub async fn run(&self, mut receiver: OutboundReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "ems.mqtt",
            batch_size = self.config.batch_size,
            flush_ms = self.config.flush_interval.as_millis() as u64,
            "outbound_publisher_started"
        );
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let mut batch = Vec::with_capacity(self.config.batch_size);
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                first = receiver.recv() => match first {
                    Some(message) => batch.push(message),
                    None => break,
                },
                _ = ticker.tick() => {}
            }
            self.fill(&mut receiver, &mut batch);
            self.flush(batch).await;
        }

        receiver.close();
        loop {
            let mut batch = Vec::with_capacity(self.config.batch_size);
            self.fill(&mut receiver, &mut batch);
            if batch.is_empty() {
                break;
            }
            self.flush(batch).await;
        }
        info!(target: "ems.mqtt", "outbound_publisher_stopped");
    }
}
