use std::fmt;

/// 变量值的数据类型。
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    I64(i64),
    F64(f64),
    Bool(bool),
    String(String),
}

impl VariableValue {
    /// 数值视图（布尔按 0/1），字符串返回 None。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            VariableValue::I64(v) => Some(*v as f64),
            VariableValue::F64(v) => Some(*v),
            VariableValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            VariableValue::String(_) => None,
        }
    }

    /// 值是否“相同”：浮点按位比较，NaN 与自身相同。
    pub fn same_as(&self, other: &VariableValue) -> bool {
        match (self, other) {
            (VariableValue::F64(a), VariableValue::F64(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::I64(v) => write!(f, "{}", v),
            VariableValue::F64(v) => write!(f, "{}", v),
            VariableValue::Bool(v) => write!(f, "{}", v),
            VariableValue::String(v) => f.write_str(v),
        }
    }
}

/// 获取当前 Unix 时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
