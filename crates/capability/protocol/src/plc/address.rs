//! PLC 地址解析
//!
//! 支持的写法：
//! - 数据块：`DB1.DBX0.3`、`DB1.DBB2`、`DB1.DBW4`、`DB1.DBD8`
//! - 位存储区 / 输入 / 输出：`M0.1`、`MB3`、`MW10`、`MD20`、`I0.0`、`E1.2`、`QW4`、`A0.7`
//! - 可选类型后缀：`DB1.DBW4:INT`、`MD20:DINT`
//!
//! 默认类型：X→BOOL，B→BYTE，W→WORD，D→REAL。

use crate::error::ProtocolError;
use domain::VariableValue;
use std::fmt;
use std::str::FromStr;

/// 存储区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlcArea {
    Inputs,
    Outputs,
    Merker,
    DataBlock(u16),
}

impl PlcArea {
    /// S7 区域代码
    pub fn code(&self) -> u8 {
        match self {
            PlcArea::Inputs => 0x81,
            PlcArea::Outputs => 0x82,
            PlcArea::Merker => 0x83,
            PlcArea::DataBlock(_) => 0x84,
        }
    }

    pub fn db_number(&self) -> u16 {
        match self {
            PlcArea::DataBlock(db) => *db,
            _ => 0,
        }
    }
}

/// 数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlcDataType {
    Bool,
    Byte,
    Word,
    Int,
    DWord,
    DInt,
    Real,
}

impl PlcDataType {
    /// 占用字节数
    pub fn byte_len(&self) -> usize {
        match self {
            PlcDataType::Bool | PlcDataType::Byte => 1,
            PlcDataType::Word | PlcDataType::Int => 2,
            PlcDataType::DWord | PlcDataType::DInt | PlcDataType::Real => 4,
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "BOOL" => Some(PlcDataType::Bool),
            "BYTE" => Some(PlcDataType::Byte),
            "WORD" => Some(PlcDataType::Word),
            "INT" => Some(PlcDataType::Int),
            "DWORD" => Some(PlcDataType::DWord),
            "DINT" => Some(PlcDataType::DInt),
            "REAL" => Some(PlcDataType::Real),
            _ => None,
        }
    }
}

/// 访问宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Bit,
    Byte,
    Word,
    DWord,
}

impl Width {
    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'X' => Some(Width::Bit),
            'B' => Some(Width::Byte),
            'W' => Some(Width::Word),
            'D' => Some(Width::DWord),
            _ => None,
        }
    }

    fn default_type(&self) -> PlcDataType {
        match self {
            Width::Bit => PlcDataType::Bool,
            Width::Byte => PlcDataType::Byte,
            Width::Word => PlcDataType::Word,
            Width::DWord => PlcDataType::Real,
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Width::Bit | Width::Byte => 1,
            Width::Word => 2,
            Width::DWord => 4,
        }
    }
}

/// 解析后的 PLC 地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlcAddress {
    pub area: PlcArea,
    pub byte_offset: u32,
    pub bit: u8,
    pub data_type: PlcDataType,
}

impl PlcAddress {
    pub fn is_bit(&self) -> bool {
        self.data_type == PlcDataType::Bool
    }

    /// S7 地址字段：byte * 8 + bit
    pub fn bit_address(&self) -> u32 {
        self.byte_offset * 8 + u32::from(self.bit)
    }

    /// 解码读取到的原始字节（大端）
    pub fn decode(&self, bytes: &[u8]) -> Result<VariableValue, ProtocolError> {
        let need = self.data_type.byte_len();
        if bytes.len() < need {
            return Err(ProtocolError::DataParse(format!(
                "{}: need {} bytes, got {}",
                self,
                need,
                bytes.len()
            )));
        }
        let value = match self.data_type {
            PlcDataType::Bool => VariableValue::Bool(bytes[0] & 0x01 != 0),
            PlcDataType::Byte => VariableValue::I64(i64::from(bytes[0])),
            PlcDataType::Word => VariableValue::I64(i64::from(u16::from_be_bytes([bytes[0], bytes[1]]))),
            PlcDataType::Int => VariableValue::I64(i64::from(i16::from_be_bytes([bytes[0], bytes[1]]))),
            PlcDataType::DWord => VariableValue::I64(i64::from(u32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            PlcDataType::DInt => VariableValue::I64(i64::from(i32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
            PlcDataType::Real => VariableValue::F64(f64::from(f32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]))),
        };
        Ok(value)
    }

    /// 编码写入值（大端）
    pub fn encode(&self, value: &VariableValue) -> Result<Vec<u8>, ProtocolError> {
        let mismatch = || {
            ProtocolError::DataParse(format!("{}: cannot write {:?}", self, value))
        };
        let integer = |min: i64, max: i64| -> Result<i64, ProtocolError> {
            let raw = match value {
                VariableValue::I64(v) => *v,
                VariableValue::F64(v) if v.fract() == 0.0 && v.is_finite() => *v as i64,
                VariableValue::Bool(v) => i64::from(*v),
                _ => return Err(mismatch()),
            };
            if raw < min || raw > max {
                return Err(ProtocolError::DataParse(format!(
                    "{}: value {} out of range",
                    self, raw
                )));
            }
            Ok(raw)
        };
        let bytes = match self.data_type {
            PlcDataType::Bool => match value {
                VariableValue::Bool(v) => vec![u8::from(*v)],
                VariableValue::I64(v) => vec![u8::from(*v != 0)],
                _ => return Err(mismatch()),
            },
            PlcDataType::Byte => vec![integer(0, 0xFF)? as u8],
            PlcDataType::Word => (integer(0, 0xFFFF)? as u16).to_be_bytes().to_vec(),
            PlcDataType::Int => {
                (integer(i64::from(i16::MIN), i64::from(i16::MAX))? as i16)
                    .to_be_bytes()
                    .to_vec()
            }
            PlcDataType::DWord => (integer(0, i64::from(u32::MAX))? as u32).to_be_bytes().to_vec(),
            PlcDataType::DInt => {
                (integer(i64::from(i32::MIN), i64::from(i32::MAX))? as i32)
                    .to_be_bytes()
                    .to_vec()
            }
            PlcDataType::Real => {
                let v = value.as_f64().ok_or_else(|| mismatch())?;
                (v as f32).to_be_bytes().to_vec()
            }
        };
        Ok(bytes)
    }
}

impl fmt::Display for PlcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = match self.data_type.byte_len() {
            1 if self.is_bit() => 'X',
            1 => 'B',
            2 => 'W',
            _ => 'D',
        };
        match self.area {
            PlcArea::DataBlock(db) if self.is_bit() => {
                write!(f, "DB{}.DBX{}.{}", db, self.byte_offset, self.bit)
            }
            PlcArea::DataBlock(db) => write!(f, "DB{}.DB{}{}", db, width, self.byte_offset),
            area => {
                let prefix = match area {
                    PlcArea::Inputs => 'I',
                    PlcArea::Outputs => 'Q',
                    _ => 'M',
                };
                if self.is_bit() {
                    write!(f, "{}{}.{}", prefix, self.byte_offset, self.bit)
                } else {
                    write!(f, "{}{}{}", prefix, width, self.byte_offset)
                }
            }
        }
    }
}

impl FromStr for PlcAddress {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_address(raw)
    }
}

fn invalid(raw: &str, reason: &str) -> ProtocolError {
    ProtocolError::Address(format!("{}: {}", raw, reason))
}

/// 解析 PLC 地址字符串
pub fn parse_address(raw: &str) -> Result<PlcAddress, ProtocolError> {
    let upper = raw.trim().to_ascii_uppercase();
    let (body, type_tag) = match upper.split_once(':') {
        Some((body, tag)) => (body.trim(), Some(tag.trim())),
        None => (upper.as_str(), None),
    };
    if body.is_empty() {
        return Err(invalid(raw, "empty address"));
    }

    let (area, rest) = if let Some(rest) = body.strip_prefix("DB") {
        let (db, member) = rest
            .split_once('.')
            .ok_or_else(|| invalid(raw, "missing data block member"))?;
        let db: u16 = db.parse().map_err(|_| invalid(raw, "bad data block number"))?;
        let member = member
            .strip_prefix("DB")
            .ok_or_else(|| invalid(raw, "data block member must start with DB"))?;
        (PlcArea::DataBlock(db), member)
    } else {
        let mut chars = body.chars();
        let area = match chars.next() {
            Some('M') => PlcArea::Merker,
            Some('I') | Some('E') => PlcArea::Inputs,
            Some('Q') | Some('A') => PlcArea::Outputs,
            _ => return Err(invalid(raw, "unknown area")),
        };
        (area, chars.as_str())
    };

    let (width, offset_part) = match rest.chars().next() {
        Some(letter) if letter.is_ascii_alphabetic() => {
            let width = Width::from_letter(letter).ok_or_else(|| invalid(raw, "unknown width"))?;
            (width, &rest[1..])
        }
        Some(_) if rest.contains('.') => (Width::Bit, rest),
        Some(_) => return Err(invalid(raw, "missing width")),
        None => return Err(invalid(raw, "missing offset")),
    };

    let (byte_offset, bit) = match (width, offset_part.split_once('.')) {
        (Width::Bit, Some((byte, bit))) => {
            let bit: u8 = bit.parse().map_err(|_| invalid(raw, "bad bit number"))?;
            if bit > 7 {
                return Err(invalid(raw, "bit number must be 0..=7"));
            }
            (byte, bit)
        }
        (Width::Bit, None) => return Err(invalid(raw, "bit access needs .<bit>")),
        (_, Some(_)) => return Err(invalid(raw, "only bit access takes .<bit>")),
        (_, None) => (offset_part, 0),
    };
    let byte_offset: u32 = byte_offset
        .parse()
        .map_err(|_| invalid(raw, "bad byte offset"))?;
    if byte_offset > 0x1F_FFFF {
        return Err(invalid(raw, "byte offset out of range"));
    }

    let data_type = match type_tag {
        Some(tag) => PlcDataType::parse(tag).ok_or_else(|| invalid(raw, "unknown type"))?,
        None => width.default_type(),
    };
    let compatible = match width {
        Width::Bit => data_type == PlcDataType::Bool,
        _ => data_type != PlcDataType::Bool && data_type.byte_len() == width.byte_len(),
    };
    if !compatible {
        return Err(invalid(raw, "type does not match access width"));
    }

    Ok(PlcAddress {
        area,
        byte_offset,
        bit,
        data_type,
    })
}
