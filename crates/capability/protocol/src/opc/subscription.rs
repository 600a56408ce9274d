//! 订阅引擎：每个（设备，发布间隔）一个订阅，节点级幂等

use crate::error::ProtocolError;
use crate::opc::session::{MonitoredItemSpec, OpcSession};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubscriptionSlot {
    id: u32,
    revised_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackedItem {
    /// 所属订阅的请求发布间隔
    key: u64,
    item_id: u32,
}

#[derive(Debug, Default)]
pub struct SubscriptionEngine {
    subscriptions: BTreeMap<u64, SubscriptionSlot>,
    tracked: HashMap<String, TrackedItem>,
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, node_id: &str) -> bool {
        self.tracked.contains_key(node_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// 某个发布间隔对应的订阅 id
    pub fn subscription_id(&self, publishing_interval_ms: u64) -> Option<u32> {
        self.subscriptions
            .get(&publishing_interval_ms)
            .map(|slot| slot.id)
    }

    async fn ensure_subscription(
        &mut self,
        session: &dyn OpcSession,
        publishing_interval_ms: u64,
    ) -> Result<u32, ProtocolError> {
        match self.subscriptions.get(&publishing_interval_ms).copied() {
            Some(slot) if slot.revised_ms == publishing_interval_ms => Ok(slot.id),
            Some(slot) => {
                let revised = session
                    .modify_subscription(slot.id, publishing_interval_ms)
                    .await?;
                debug!(
                    target: "ems.opc",
                    subscription_id = slot.id,
                    requested_ms = publishing_interval_ms,
                    revised_ms = revised,
                    "subscription_modified"
                );
                self.subscriptions.insert(
                    publishing_interval_ms,
                    SubscriptionSlot {
                        id: slot.id,
                        revised_ms: revised,
                    },
                );
                Ok(slot.id)
            }
            None => {
                let (id, revised) = session.create_subscription(publishing_interval_ms).await?;
                debug!(
                    target: "ems.opc",
                    subscription_id = id,
                    requested_ms = publishing_interval_ms,
                    revised_ms = revised,
                    "subscription_created"
                );
                self.subscriptions.insert(
                    publishing_interval_ms,
                    SubscriptionSlot {
                        id,
                        revised_ms: revised,
                    },
                );
                Ok(id)
            }
        }
    }

    /// 为未跟踪的节点批量创建监控项，返回本次新跟踪的节点
    ///
    /// 已跟踪的节点（无论在哪个间隔下）直接跳过。
    pub async fn subscribe(
        &mut self,
        session: &dyn OpcSession,
        node_ids: &[String],
        publishing_interval_ms: u64,
        sampling_interval_ms: u64,
    ) -> Result<Vec<String>, ProtocolError> {
        let subscription_id = self
            .ensure_subscription(session, publishing_interval_ms)
            .await?;

        let mut seen = HashSet::new();
        let pending: Vec<String> = node_ids
            .iter()
            .filter(|node_id| !self.tracked.contains_key(node_id.as_str()))
            .filter(|node_id| seen.insert(node_id.as_str()))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let specs: Vec<MonitoredItemSpec> = pending
            .iter()
            .map(|node_id| MonitoredItemSpec {
                node_id: node_id.clone(),
                sampling_interval_ms,
            })
            .collect();
        let results = session
            .create_monitored_items(subscription_id, &specs)
            .await?;

        let mut added = Vec::with_capacity(pending.len());
        for (node_id, result) in pending.into_iter().zip(results) {
            match result {
                Ok(item_id) => {
                    self.tracked.insert(
                        node_id.clone(),
                        TrackedItem {
                            key: publishing_interval_ms,
                            item_id,
                        },
                    );
                    added.push(node_id);
                }
                Err(reason) => warn!(
                    target: "ems.opc",
                    node_id = %node_id,
                    reason = %reason,
                    "monitored_item_rejected"
                ),
            }
        }
        Ok(added)
    }

    /// 批量删除监控项；订阅变空后一并删除
    pub async fn unsubscribe(
        &mut self,
        session: &dyn OpcSession,
        node_ids: &[String],
    ) -> Result<usize, ProtocolError> {
        let mut by_key: BTreeMap<u64, Vec<(String, u32)>> = BTreeMap::new();
        for node_id in node_ids {
            if let Some(item) = self.tracked.get(node_id) {
                by_key
                    .entry(item.key)
                    .or_default()
                    .push((node_id.clone(), item.item_id));
            }
        }

        let mut removed = 0;
        for (key, items) in by_key {
            let Some(slot) = self.subscriptions.get(&key).copied() else {
                continue;
            };
            let item_ids: Vec<u32> = items.iter().map(|(_, id)| *id).collect();
            session.delete_monitored_items(slot.id, &item_ids).await?;
            for (node_id, _) in &items {
                self.tracked.remove(node_id);
            }
            removed += items.len();

            if !self.tracked.values().any(|item| item.key == key) {
                self.subscriptions.remove(&key);
                if let Err(err) = session.delete_subscription(slot.id).await {
                    warn!(
                        target: "ems.opc",
                        subscription_id = slot.id,
                        error = %err,
                        "subscription_delete_failed"
                    );
                }
            }
        }
        Ok(removed)
    }

    /// 会话失效后丢弃全部本地状态（服务端订阅随会话消失）
    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.tracked.clear();
    }
}
