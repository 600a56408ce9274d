//! 外发消息队列
//!
//! 流水线与写入方把待发布消息放入进程内唯一的无界队列，由外发发布循环批量取出。

use domain::{DeviceId, VariableValue};
use tokio::sync::mpsc;

/// 待发布的外发消息
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOutboundMessage {
    pub broker_id: DeviceId,
    pub topic: String,
    pub payload: String,
}

impl PendingOutboundMessage {
    /// 以别名负载构造消息
    pub fn for_alias(
        broker_id: DeviceId,
        topic: impl Into<String>,
        alias: &str,
        value: &VariableValue,
        ts_ms: i64,
    ) -> Self {
        Self {
            broker_id,
            topic: topic.into(),
            payload: encode_payload(alias, value, ts_ms),
        }
    }
}

/// 外发负载：`{"alias": .., "value": .., "ts": ..}`
pub fn encode_payload(alias: &str, value: &VariableValue, ts_ms: i64) -> String {
    serde_json::json!({
        "alias": alias,
        "value": value_to_json(value),
        "ts": ts_ms,
    })
    .to_string()
}

pub fn value_to_json(value: &VariableValue) -> serde_json::Value {
    match value {
        VariableValue::I64(v) => serde_json::Value::from(*v),
        VariableValue::F64(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        VariableValue::Bool(v) => serde_json::Value::Bool(*v),
        VariableValue::String(v) => serde_json::Value::String(v.clone()),
    }
}

/// 外发队列写端
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<PendingOutboundMessage>,
}

impl OutboundQueue {
    /// 非阻塞入队；发布循环已退出时返回 false。
    pub fn enqueue(&self, message: PendingOutboundMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// 外发队列读端（由发布循环独占）
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<PendingOutboundMessage>,
}

impl OutboundReceiver {
    pub async fn recv(&mut self) -> Option<PendingOutboundMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PendingOutboundMessage> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn outbound_queue() -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundQueue { tx }, OutboundReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_alias_value_and_ts() {
        let payload = encode_payload("temp", &VariableValue::F64(21.5), 1_700);
        let parsed: serde_json::Value = serde_json::from_str(&payload).expect("json");
        assert_eq!(parsed["alias"], "temp");
        assert_eq!(parsed["value"], 21.5);
        assert_eq!(parsed["ts"], 1_700);
    }

    #[test]
    fn non_finite_float_becomes_null() {
        assert_eq!(
            value_to_json(&VariableValue::F64(f64::NAN)),
            serde_json::Value::Null
        );
    }
}
