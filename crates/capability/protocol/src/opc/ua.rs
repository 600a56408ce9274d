//! 基于 async-opcua 的会话实现（`opcua` 特性）

use crate::error::ProtocolError;
use crate::opc::session::{
    BrowseEntry, BrowsePage, DataChange, MonitoredItemSpec, NodeClass, OpcConnector, OpcLink,
    OpcSession, SessionStatus,
};
use async_trait::async_trait;
use domain::{OpcEndpoint, VariableValue, now_epoch_ms};
use opcua::client::{ClientBuilder, DataChangeCallback, IdentityToken, MonitoredItem, Session};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    AttributeId, BrowseDescription, BrowseDescriptionResultMask, BrowseDirection, BrowseResult,
    ByteString, DataValue, MessageSecurityMode, MonitoredItemCreateRequest, MonitoredItemCreateResult,
    NodeClass as UaNodeClass,
    NodeId, ReadValueId, ReferenceTypeId, StatusCode, TimestampsToReturn, UserTokenPolicy, Variant,
    WriteValue,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::warn;

const LIFETIME_COUNT: u32 = 60;
const KEEP_ALIVE_COUNT: u32 = 10;
const MAX_NOTIFICATIONS: u32 = 0;
const PRIORITY: u8 = 0;

fn opc_err(context: &str, status: StatusCode) -> ProtocolError {
    ProtocolError::Opc(format!("{}: {}", context, status))
}

fn parse_node_id(raw: &str) -> Result<NodeId, ProtocolError> {
    NodeId::from_str(raw).map_err(|_| ProtocolError::Address(format!("bad node id: {}", raw)))
}

fn variant_to_value(variant: &Variant) -> Option<VariableValue> {
    let value = match variant {
        Variant::Boolean(v) => VariableValue::Bool(*v),
        Variant::SByte(v) => VariableValue::I64(i64::from(*v)),
        Variant::Byte(v) => VariableValue::I64(i64::from(*v)),
        Variant::Int16(v) => VariableValue::I64(i64::from(*v)),
        Variant::UInt16(v) => VariableValue::I64(i64::from(*v)),
        Variant::Int32(v) => VariableValue::I64(i64::from(*v)),
        Variant::UInt32(v) => VariableValue::I64(i64::from(*v)),
        Variant::Int64(v) => VariableValue::I64(*v),
        Variant::UInt64(v) => VariableValue::I64(*v as i64),
        Variant::Float(v) => VariableValue::F64(f64::from(*v)),
        Variant::Double(v) => VariableValue::F64(*v),
        Variant::String(v) => VariableValue::String(v.as_ref().to_string()),
        _ => return None,
    };
    Some(value)
}

fn value_to_variant(value: &VariableValue) -> Variant {
    match value {
        VariableValue::Bool(v) => Variant::Boolean(*v),
        VariableValue::I64(v) => Variant::Int64(*v),
        VariableValue::F64(v) => Variant::Double(*v),
        VariableValue::String(v) => Variant::String(v.as_str().into()),
    }
}

fn data_value_result(data_value: &DataValue) -> Result<VariableValue, String> {
    if let Some(status) = data_value.status {
        if status.is_bad() {
            return Err(status.to_string());
        }
    }
    data_value
        .value
        .as_ref()
        .and_then(variant_to_value)
        .ok_or_else(|| "unsupported or empty value".to_string())
}

fn source_ts_ms(data_value: &DataValue) -> i64 {
    data_value
        .source_timestamp
        .as_ref()
        .map(|ts| ts.as_chrono().timestamp_millis())
        .unwrap_or_else(now_epoch_ms)
}

fn node_class(class: UaNodeClass) -> NodeClass {
    match class {
        UaNodeClass::Object => NodeClass::Object,
        UaNodeClass::Variable => NodeClass::Variable,
        UaNodeClass::Method => NodeClass::Method,
        _ => NodeClass::Other,
    }
}

fn page_from(result: Option<BrowseResult>) -> Result<BrowsePage, ProtocolError> {
    let Some(result) = result else {
        return Ok(BrowsePage::default());
    };
    if result.status_code.is_bad() {
        return Err(opc_err("browse", result.status_code));
    }
    let entries = result
        .references
        .unwrap_or_default()
        .into_iter()
        .map(|reference| BrowseEntry {
            node_id: reference.node_id.node_id.to_string(),
            browse_name: reference.browse_name.name.as_ref().to_string(),
            display_name: reference.display_name.text.as_ref().to_string(),
            node_class: node_class(reference.node_class),
        })
        .collect();
    let continuation = result
        .continuation_point
        .value
        .filter(|point| !point.is_empty());
    Ok(BrowsePage {
        entries,
        continuation,
    })
}

fn item_outcome(item: MonitoredItemCreateResult) -> Result<u32, String> {
    if item.status_code.is_good() {
        Ok(item.monitored_item_id)
    } else {
        Err(item.status_code.to_string())
    }
}

pub struct UaSession {
    session: Arc<Session>,
    changes: mpsc::UnboundedSender<DataChange>,
}

impl UaSession {
    fn read_ids(node_ids: &[String], attribute: AttributeId) -> Result<Vec<ReadValueId>, ProtocolError> {
        node_ids
            .iter()
            .map(|raw| {
                Ok(ReadValueId {
                    node_id: parse_node_id(raw)?,
                    attribute_id: attribute as u32,
                    ..Default::default()
                })
            })
            .collect()
    }
}

#[async_trait]
impl OpcSession for UaSession {
    async fn browse(&self, node_id: &str) -> Result<BrowsePage, ProtocolError> {
        let description = BrowseDescription {
            node_id: parse_node_id(node_id)?,
            browse_direction: BrowseDirection::Forward,
            reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
            include_subtypes: true,
            node_class_mask: 0,
            result_mask: BrowseDescriptionResultMask::all().bits(),
        };
        let results = self
            .session
            .browse(&[description], 0, None)
            .await
            .map_err(|status| opc_err("browse", status))?;
        page_from(results.into_iter().next())
    }

    async fn browse_next(&self, continuation: &[u8]) -> Result<BrowsePage, ProtocolError> {
        let point = ByteString::from(continuation.to_vec());
        let results = self
            .session
            .browse_next(false, &[point])
            .await
            .map_err(|status| opc_err("browse_next", status))?;
        page_from(results.into_iter().next())
    }

    async fn read_values(
        &self,
        node_ids: &[String],
    ) -> Result<Vec<Result<VariableValue, String>>, ProtocolError> {
        let ids = Self::read_ids(node_ids, AttributeId::Value)?;
        let values = self
            .session
            .read(&ids, TimestampsToReturn::Source, 0.0)
            .await
            .map_err(|status| opc_err("read", status))?;
        Ok(values.iter().map(data_value_result).collect())
    }

    async fn read_data_types(
        &self,
        node_ids: &[String],
    ) -> Result<Vec<Option<String>>, ProtocolError> {
        let ids = Self::read_ids(node_ids, AttributeId::DataType)?;
        let values = self
            .session
            .read(&ids, TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(|status| opc_err("read data type", status))?;
        Ok(values
            .into_iter()
            .map(|value| match value.value {
                Some(Variant::NodeId(id)) => Some(id.to_string()),
                _ => None,
            })
            .collect())
    }

    async fn write_value(&self, node_id: &str, value: &VariableValue) -> Result<(), ProtocolError> {
        let write = WriteValue {
            node_id: parse_node_id(node_id)?,
            attribute_id: AttributeId::Value as u32,
            value: DataValue::new_now(value_to_variant(value)),
            ..Default::default()
        };
        let results = self
            .session
            .write(&[write])
            .await
            .map_err(|status| opc_err("write", status))?;
        match results.first() {
            Some(status) if status.is_bad() => Err(opc_err("write", *status)),
            _ => Ok(()),
        }
    }

    async fn create_subscription(
        &self,
        publishing_interval_ms: u64,
    ) -> Result<(u32, u64), ProtocolError> {
        let changes = self.changes.clone();
        let id = self
            .session
            .create_subscription(
                Duration::from_millis(publishing_interval_ms),
                LIFETIME_COUNT,
                KEEP_ALIVE_COUNT,
                MAX_NOTIFICATIONS,
                PRIORITY,
                true,
                DataChangeCallback::new(move |data_value: DataValue, item: &MonitoredItem| {
                    let node_id = item.item_to_monitor().node_id.to_string();
                    match data_value_result(&data_value) {
                        Ok(value) => {
                            let _ = changes.send(DataChange {
                                node_id,
                                value,
                                ts_ms: source_ts_ms(&data_value),
                            });
                        }
                        Err(reason) => warn!(
                            target: "ems.opc",
                            node_id = %node_id,
                            reason = %reason,
                            "bad_data_change"
                        ),
                    }
                }),
            )
            .await
            .map_err(|status| opc_err("create subscription", status))?;
        Ok((id, publishing_interval_ms))
    }

    async fn modify_subscription(
        &self,
        subscription_id: u32,
        publishing_interval_ms: u64,
    ) -> Result<u64, ProtocolError> {
        self.session
            .modify_subscription(
                subscription_id,
                Duration::from_millis(publishing_interval_ms),
                LIFETIME_COUNT,
                KEEP_ALIVE_COUNT,
                MAX_NOTIFICATIONS,
                PRIORITY,
            )
            .await
            .map_err(|status| opc_err("modify subscription", status))?;
        Ok(publishing_interval_ms)
    }

    async fn delete_subscription(&self, subscription_id: u32) -> Result<(), ProtocolError> {
        self.session
            .delete_subscription(subscription_id)
            .await
            .map_err(|status| opc_err("delete subscription", status))?;
        Ok(())
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: &[MonitoredItemSpec],
    ) -> Result<Vec<Result<u32, String>>, ProtocolError> {
        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            let mut request: MonitoredItemCreateRequest = parse_node_id(&item.node_id)?.into();
            request.requested_parameters.sampling_interval = item.sampling_interval_ms as f64;
            requests.push(request);
        }
        let created = self
            .session
            .create_monitored_items(subscription_id, TimestampsToReturn::Source, requests)
            .await
            .map_err(|status| opc_err("create monitored items", status))?;
        Ok(created.into_iter().map(item_outcome).collect())
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        item_ids: &[u32],
    ) -> Result<(), ProtocolError> {
        self.session
            .delete_monitored_items(subscription_id, item_ids)
            .await
            .map_err(|status| opc_err("delete monitored items", status))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.session
            .disconnect()
            .await
            .map_err(|status| opc_err("disconnect", status))
    }
}

/// async-opcua 连接器：匿名或用户名密码，无安全策略
#[derive(Debug, Clone)]
pub struct UaConnector {
    pub application_name: String,
}

impl Default for UaConnector {
    fn default() -> Self {
        Self {
            application_name: "ems-gateway".to_string(),
        }
    }
}

#[async_trait]
impl OpcConnector for UaConnector {
    async fn connect(
        &self,
        endpoint: &OpcEndpoint,
        timeout: Duration,
    ) -> Result<OpcLink, ProtocolError> {
        let mut client = ClientBuilder::new()
            .application_name(&self.application_name)
            .application_uri(format!("urn:{}", self.application_name))
            .create_sample_keypair(true)
            .trust_server_certs(true)
            .session_retry_limit(0)
            .client()
            .map_err(|errors| ProtocolError::Opc(errors.join(", ")))?;

        let identity = match (&endpoint.username, &endpoint.password) {
            (Some(username), Some(password)) if !username.is_empty() => {
                IdentityToken::UserName(username.clone(), password.clone())
            }
            _ => IdentityToken::Anonymous,
        };

        let connect = client.connect_to_matching_endpoint(
            (
                endpoint.server_url.as_str(),
                SecurityPolicy::None.to_str(),
                MessageSecurityMode::None,
                UserTokenPolicy::anonymous(),
            ),
            identity,
        );
        let (session, event_loop) = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ProtocolError::Timeout(endpoint.server_url.clone()))?
            .map_err(|status| ProtocolError::Connection(status.to_string()))?;

        let (status_tx, status_rx) = watch::channel(SessionStatus::Connected);
        let handle = event_loop.spawn();
        tokio::spawn(async move {
            let reason = match handle.await {
                Ok(status) => format!("session ended: {}", status),
                Err(err) => format!("session event loop failed: {}", err),
            };
            let _ = status_tx.send(SessionStatus::Disconnected(reason));
        });

        if !tokio::time::timeout(timeout, session.wait_for_connection())
            .await
            .unwrap_or(false)
        {
            return Err(ProtocolError::Connection(format!(
                "session to {} not established",
                endpoint.server_url
            )));
        }

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Ok(OpcLink {
            session: Arc::new(UaSession {
                session,
                changes: changes_tx,
            }),
            changes: changes_rx,
            status: status_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcua::types::{ExpandedNodeId, ReferenceDescription};

    #[test]
    fn created_items_map_to_ids_or_status() {
        let ok = MonitoredItemCreateResult {
            status_code: StatusCode::Good,
            monitored_item_id: 7,
            ..Default::default()
        };
        assert_eq!(item_outcome(ok), Ok(7));

        let rejected = MonitoredItemCreateResult {
            status_code: StatusCode::BadNodeIdUnknown,
            monitored_item_id: 0,
            ..Default::default()
        };
        let reason = item_outcome(rejected).expect_err("rejected");
        assert!(reason.contains("BadNodeIdUnknown"), "{}", reason);
    }

    #[test]
    fn browse_page_keeps_continuation_and_classes() {
        let result = BrowseResult {
            status_code: StatusCode::Good,
            continuation_point: ByteString::from(vec![1, 2]),
            references: Some(vec![ReferenceDescription {
                node_id: ExpandedNodeId::from(NodeId::new(2, "line1")),
                browse_name: "line1".into(),
                display_name: "Line 1".into(),
                node_class: UaNodeClass::Object,
                ..Default::default()
            }]),
        };
        let page = page_from(Some(result)).expect("page");
        assert_eq!(page.continuation, Some(vec![1, 2]));
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].node_id, "ns=2;s=line1");
        assert_eq!(page.entries[0].display_name, "Line 1");
        assert_eq!(page.entries[0].node_class, NodeClass::Object);

        let empty = BrowseResult {
            status_code: StatusCode::Good,
            continuation_point: ByteString::null(),
            references: None,
        };
        assert_eq!(page_from(Some(empty)).expect("page").continuation, None);

        let bad = BrowseResult {
            status_code: StatusCode::BadNodeIdUnknown,
            ..Default::default()
        };
        assert!(page_from(Some(bad)).is_err());
    }

    #[test]
    fn variants_convert_to_engine_values() {
        assert_eq!(
            variant_to_value(&Variant::Float(1.5)),
            Some(VariableValue::F64(1.5))
        );
        assert_eq!(
            variant_to_value(&Variant::UInt16(9)),
            Some(VariableValue::I64(9))
        );
        assert_eq!(variant_to_value(&Variant::Empty), None);

        let bad = DataValue {
            value: Some(Variant::Int32(1)),
            status: Some(StatusCode::BadNodeIdUnknown),
            ..Default::default()
        };
        assert!(data_value_result(&bad).is_err());
    }
}
