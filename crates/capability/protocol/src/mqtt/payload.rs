//! MQTT 入站载荷解析
//!
//! 支持三种写法：
//! - 单个对象 `{"alias": "t1", "value": 21.5, "ts": 1700000000000}`（`ts` 可省略）
//! - 对象数组
//! - 裸标量（JSON 标量或纯文本），别名取主题最后一段

use crate::error::ProtocolError;
use domain::VariableValue;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct InboundValue {
    pub alias: String,
    pub value: VariableValue,
    pub ts_ms: i64,
}

fn scalar(value: &Value) -> Option<VariableValue> {
    match value {
        Value::Bool(v) => Some(VariableValue::Bool(*v)),
        Value::Number(n) => n
            .as_i64()
            .map(VariableValue::I64)
            .or_else(|| n.as_f64().map(VariableValue::F64)),
        Value::String(s) => Some(VariableValue::String(s.clone())),
        _ => None,
    }
}

fn from_object(value: &Value, now_ms: i64) -> Result<InboundValue, ProtocolError> {
    let alias = value
        .get("alias")
        .and_then(Value::as_str)
        .filter(|alias| !alias.is_empty())
        .ok_or_else(|| ProtocolError::DataParse("missing alias".to_string()))?;
    let raw = value
        .get("value")
        .ok_or_else(|| ProtocolError::DataParse(format!("{}: missing value", alias)))?;
    let parsed = scalar(raw)
        .ok_or_else(|| ProtocolError::DataParse(format!("{}: value is not a scalar", alias)))?;
    let ts_ms = value.get("ts").and_then(Value::as_i64).unwrap_or(now_ms);
    Ok(InboundValue {
        alias: alias.to_string(),
        value: parsed,
        ts_ms,
    })
}

fn topic_alias(topic: &str) -> Option<&str> {
    topic
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
}

fn text_scalar(text: &str) -> VariableValue {
    let text = text.trim();
    if let Ok(v) = text.parse::<i64>() {
        VariableValue::I64(v)
    } else if let Ok(v) = text.parse::<f64>() {
        VariableValue::F64(v)
    } else if let Ok(v) = text.parse::<bool>() {
        VariableValue::Bool(v)
    } else {
        VariableValue::String(text.to_string())
    }
}

/// 解析一条入站消息；数组中单个元素出错时跳过该元素
pub fn parse_inbound(
    topic: &str,
    payload: &[u8],
    now_ms: i64,
) -> Result<Vec<InboundValue>, ProtocolError> {
    let text = std::str::from_utf8(payload)
        .map_err(|err| ProtocolError::DataParse(format!("payload is not utf-8: {}", err)))?;
    let bare = |value: VariableValue| -> Result<Vec<InboundValue>, ProtocolError> {
        let alias = topic_alias(topic)
            .ok_or_else(|| ProtocolError::DataParse(format!("no alias in topic {}", topic)))?;
        Ok(vec![InboundValue {
            alias: alias.to_string(),
            value,
            ts_ms: now_ms,
        }])
    };

    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(vec![from_object(&value, now_ms)?]),
        Ok(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| from_object(item, now_ms).ok())
            .collect()),
        Ok(Value::Null) => Ok(Vec::new()),
        Ok(value) => match scalar(&value) {
            Some(parsed) => bare(parsed),
            None => Ok(Vec::new()),
        },
        Err(_) if text.trim().is_empty() => Ok(Vec::new()),
        Err(_) => bare(text_scalar(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_with_timestamp() {
        let values = parse_inbound(
            "plant/line1",
            br#"{"alias":"temp","value":21.5,"ts":1700000000000}"#,
            1,
        )
        .expect("object");
        assert_eq!(
            values,
            vec![InboundValue {
                alias: "temp".to_string(),
                value: VariableValue::F64(21.5),
                ts_ms: 1_700_000_000_000,
            }]
        );
    }

    #[test]
    fn parses_array_and_skips_bad_items() {
        let values = parse_inbound(
            "plant/line1",
            br#"[{"alias":"a","value":1},{"value":2},{"alias":"c","value":true}]"#,
            42,
        )
        .expect("array");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value, VariableValue::I64(1));
        assert_eq!(values[0].ts_ms, 42);
        assert_eq!(values[1].alias, "c");
    }

    #[test]
    fn bare_scalar_uses_last_topic_segment() {
        let values = parse_inbound("plant/line1/pressure", b"3.25", 7).expect("scalar");
        assert_eq!(values[0].alias, "pressure");
        assert_eq!(values[0].value, VariableValue::F64(3.25));

        let values = parse_inbound("plant/line1/state", b"running", 7).expect("text");
        assert_eq!(values[0].value, VariableValue::String("running".to_string()));
    }

    #[test]
    fn object_without_alias_is_rejected() {
        assert!(parse_inbound("t", br#"{"value":1}"#, 0).is_err());
    }
}
