//! S7 报文编解码（ISO-on-TCP：TPKT + COTP + S7）
//!
//! ```text
//! TPKT  03 00 <len:2>
//! COTP  02 F0 80                   (DT 数据帧)
//! S7    32 <rosctr> 00 00 <pdu_ref:2> <param_len:2> <data_len:2> [<err_class> <err_code>]
//! ```

use crate::error::ProtocolError;
use crate::plc::address::PlcAddress;
use domain::VariableValue;

/// ISO-on-TCP 默认端口
pub const ISO_TCP_PORT: u16 = 102;
/// 建议 PDU 长度
pub const DEFAULT_PDU_SIZE: u16 = 960;

const TPKT_LEN: usize = 4;
const COTP_DT_LEN: usize = 3;
const S7_JOB_HEADER_LEN: usize = 10;
const S7_ACK_HEADER_LEN: usize = 12;
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FUNC_READ_VAR: u8 = 0x04;
const FUNC_WRITE_VAR: u8 = 0x05;
const FUNC_SETUP: u8 = 0xF0;
const RETURN_OK: u8 = 0xFF;
const TS_BIT: u8 = 0x01;
const TS_BYTE: u8 = 0x02;
const DATA_TS_BIT: u8 = 0x03;
const DATA_TS_BYTE: u8 = 0x04;
const DATA_TS_OCTET: u8 = 0x09;

/// COTP 连接请求（TSAP 由机架号和槽号计算）
pub fn connect_request(rack: u16, slot: u16) -> Vec<u8> {
    let remote_tsap = (((rack & 0x07) << 5) | (slot & 0x1F)) as u8;
    vec![
        0x03, 0x00, 0x00, 0x16, // TPKT
        0x11, 0xE0, 0x00, 0x00, 0x00, 0x01, 0x00, // COTP CR
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // local TSAP
        0xC2, 0x02, 0x03, remote_tsap, // remote TSAP
    ]
}

/// COTP 连接确认
pub fn parse_connect_confirm(frame: &[u8]) -> Result<(), ProtocolError> {
    if frame.len() < 6 || frame[5] != 0xD0 {
        return Err(ProtocolError::Connection(
            "cotp connection refused".to_string(),
        ));
    }
    Ok(())
}

fn job_frame(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let total = TPKT_LEN + COTP_DT_LEN + S7_JOB_HEADER_LEN + params.len() + data.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[0x03, 0x00]);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[0x02, 0xF0, 0x80]);
    frame.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}

/// 通信建立请求（协商 PDU 长度）
pub fn setup_communication_request(pdu_ref: u16, pdu_size: u16) -> Vec<u8> {
    let mut params = vec![FUNC_SETUP, 0x00, 0x00, 0x01, 0x00, 0x01];
    params.extend_from_slice(&pdu_size.to_be_bytes());
    job_frame(pdu_ref, &params, &[])
}

/// S7 应答（ack_data）的参数与数据部分
struct Ack<'a> {
    params: &'a [u8],
    data: &'a [u8],
}

fn parse_ack(frame: &[u8]) -> Result<Ack<'_>, ProtocolError> {
    let header = TPKT_LEN + COTP_DT_LEN;
    if frame.len() < header + S7_ACK_HEADER_LEN {
        return Err(ProtocolError::S7(format!("short frame: {} bytes", frame.len())));
    }
    let s7 = &frame[header..];
    if s7[0] != S7_PROTOCOL_ID {
        return Err(ProtocolError::S7(format!("bad protocol id 0x{:02X}", s7[0])));
    }
    if s7[1] != ROSCTR_ACK_DATA {
        return Err(ProtocolError::S7(format!("unexpected rosctr 0x{:02X}", s7[1])));
    }
    let param_len = u16::from_be_bytes([s7[6], s7[7]]) as usize;
    let data_len = u16::from_be_bytes([s7[8], s7[9]]) as usize;
    let (error_class, error_code) = (s7[10], s7[11]);
    if error_class != 0 || error_code != 0 {
        return Err(ProtocolError::S7(format!(
            "error class 0x{:02X} code 0x{:02X}",
            error_class, error_code
        )));
    }
    let body = &s7[S7_ACK_HEADER_LEN..];
    if body.len() < param_len + data_len {
        return Err(ProtocolError::S7("truncated s7 body".to_string()));
    }
    Ok(Ack {
        params: &body[..param_len],
        data: &body[param_len..param_len + data_len],
    })
}

/// 通信建立应答，返回协商后的 PDU 长度
pub fn parse_setup_response(frame: &[u8]) -> Result<u16, ProtocolError> {
    let ack = parse_ack(frame)?;
    if ack.params.len() < 8 || ack.params[0] != FUNC_SETUP {
        return Err(ProtocolError::S7("bad setup response".to_string()));
    }
    Ok(u16::from_be_bytes([ack.params[6], ack.params[7]]))
}

fn item_spec(address: &PlcAddress, out: &mut Vec<u8>) {
    let (transport, count) = if address.is_bit() {
        (TS_BIT, 1u16)
    } else {
        (TS_BYTE, address.data_type.byte_len() as u16)
    };
    let start = if address.is_bit() {
        address.bit_address()
    } else {
        address.byte_offset * 8
    };
    out.extend_from_slice(&[0x12, 0x0A, 0x10, transport]);
    out.extend_from_slice(&count.to_be_bytes());
    out.extend_from_slice(&address.area.db_number().to_be_bytes());
    out.push(address.area.code());
    out.extend_from_slice(&start.to_be_bytes()[1..]);
}

/// 多项读取请求
pub fn read_var_request(pdu_ref: u16, items: &[PlcAddress]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + items.len() * 12);
    params.push(FUNC_READ_VAR);
    params.push(items.len() as u8);
    for item in items {
        item_spec(item, &mut params);
    }
    job_frame(pdu_ref, &params, &[])
}

/// 多项读取应答：逐项结果，顺序与请求一致
pub fn parse_read_response(
    frame: &[u8],
    items: &[PlcAddress],
) -> Result<Vec<Result<VariableValue, String>>, ProtocolError> {
    let ack = parse_ack(frame)?;
    if ack.params.len() < 2 || ack.params[0] != FUNC_READ_VAR {
        return Err(ProtocolError::S7("bad read response".to_string()));
    }
    let count = ack.params[1] as usize;
    if count != items.len() {
        return Err(ProtocolError::S7(format!(
            "read response has {} items, expected {}",
            count,
            items.len()
        )));
    }
    let data = ack.data;
    let mut offset = 0usize;
    let mut results = Vec::with_capacity(count);
    for (index, item) in items.iter().enumerate() {
        if offset + 4 > data.len() {
            return Err(ProtocolError::S7("truncated read data".to_string()));
        }
        let return_code = data[offset];
        let transport = data[offset + 1];
        let raw_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if return_code != RETURN_OK {
            results.push(Err(format!("return code 0x{:02X}", return_code)));
            // 失败项只有 4 字节头
            continue;
        }
        let len = match transport {
            DATA_TS_BIT | DATA_TS_BYTE => raw_len.div_ceil(8),
            DATA_TS_OCTET => raw_len,
            _ => raw_len,
        };
        if offset + len > data.len() {
            return Err(ProtocolError::S7("truncated read item".to_string()));
        }
        results.push(
            item.decode(&data[offset..offset + len])
                .map_err(|err| err.to_string()),
        );
        offset += len;
        let is_last = index + 1 == items.len();
        if len % 2 == 1 && !is_last {
            offset += 1;
        }
    }
    Ok(results)
}

/// 单项写入请求
pub fn write_var_request(pdu_ref: u16, address: &PlcAddress, payload: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(14);
    params.push(FUNC_WRITE_VAR);
    params.push(0x01);
    item_spec(address, &mut params);

    let (transport, bit_len) = if address.is_bit() {
        (DATA_TS_BIT, 1u16)
    } else {
        (DATA_TS_BYTE, (payload.len() * 8) as u16)
    };
    let mut data = Vec::with_capacity(4 + payload.len());
    data.extend_from_slice(&[0x00, transport]);
    data.extend_from_slice(&bit_len.to_be_bytes());
    data.extend_from_slice(payload);
    job_frame(pdu_ref, &params, &data)
}

/// 单项写入应答
pub fn parse_write_response(frame: &[u8]) -> Result<(), ProtocolError> {
    let ack = parse_ack(frame)?;
    if ack.params.len() < 2 || ack.params[0] != FUNC_WRITE_VAR {
        return Err(ProtocolError::S7("bad write response".to_string()));
    }
    match ack.data.first() {
        Some(&RETURN_OK) => Ok(()),
        Some(code) => Err(ProtocolError::S7(format!("write return code 0x{:02X}", code))),
        None => Err(ProtocolError::S7("empty write response".to_string())),
    }
}

/// TPKT 头中的帧总长
pub fn tpkt_length(header: &[u8; 4]) -> Result<usize, ProtocolError> {
    if header[0] != 0x03 {
        return Err(ProtocolError::Connection(format!(
            "bad tpkt version 0x{:02X}",
            header[0]
        )));
    }
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if len < TPKT_LEN + COTP_DT_LEN {
        return Err(ProtocolError::Connection(format!("bad tpkt length {}", len)));
    }
    Ok(len)
}

/// 构造应答帧（用于模拟设备）
pub fn ack_frame(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let total = TPKT_LEN + COTP_DT_LEN + S7_ACK_HEADER_LEN + params.len() + data.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[0x03, 0x00]);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[0x02, 0xF0, 0x80]);
    frame.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_ACK_DATA, 0x00, 0x00]);
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}
