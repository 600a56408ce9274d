//! S7 客户端：握手、带超时的请求应答、批量读写

use crate::error::ProtocolError;
use crate::plc::address::PlcAddress;
use crate::plc::codec;
use domain::VariableValue;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// 请求参数头 + 读取项描述
const READ_REQUEST_OVERHEAD: usize = 10 + 2;
const READ_ITEM_SPEC_LEN: usize = 12;
/// 应答头 + 参数
const READ_RESPONSE_OVERHEAD: usize = 12 + 2;
const READ_ITEM_HEADER_LEN: usize = 4;

pub struct S7Client<S> {
    stream: S,
    request_timeout: Duration,
    pdu_size: u16,
    pdu_ref: u16,
    /// 往返被中途取消后流上可能残留半帧
    in_flight: bool,
}

impl<S> S7Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// 完成 COTP 连接与 S7 通信建立
    pub async fn handshake(
        stream: S,
        rack: u16,
        slot: u16,
        request_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let mut client = Self {
            stream,
            request_timeout,
            pdu_size: codec::DEFAULT_PDU_SIZE,
            pdu_ref: 0,
            in_flight: false,
        };

        let confirm = client.exchange(&codec::connect_request(rack, slot)).await?;
        codec::parse_connect_confirm(&confirm)?;

        let pdu_ref = client.next_ref();
        let setup = client
            .exchange(&codec::setup_communication_request(
                pdu_ref,
                codec::DEFAULT_PDU_SIZE,
            ))
            .await?;
        let negotiated = codec::parse_setup_response(&setup)?;
        if negotiated < 240 {
            return Err(ProtocolError::S7(format!(
                "negotiated pdu size too small: {}",
                negotiated
            )));
        }
        client.pdu_size = negotiated;
        debug!(target: "ems.plc", pdu_size = negotiated, "s7_session_established");
        Ok(client)
    }

    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if self.in_flight {
            return Err(ProtocolError::Connection(
                "previous request was cancelled mid-frame".to_string(),
            ));
        }
        self.in_flight = true;
        let stream = &mut self.stream;
        let round_trip = async move {
            stream.write_all(request).await?;
            stream.flush().await?;
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await?;
            let len = codec::tpkt_length(&header)?;
            let mut frame = vec![0u8; len];
            frame[..4].copy_from_slice(&header);
            stream.read_exact(&mut frame[4..]).await?;
            Ok::<_, ProtocolError>(frame)
        };
        match timeout(self.request_timeout, round_trip).await {
            Ok(result) => {
                if result.is_ok() {
                    self.in_flight = false;
                }
                result
            }
            // 超时后流上可能残留半帧，按断线处理
            Err(_) => Err(ProtocolError::Connection(format!(
                "request timed out after {:?}",
                self.request_timeout
            ))),
        }
    }

    /// 按 PDU 容量切分后批量读取，结果与 `items` 顺序一致
    pub async fn read_items(
        &mut self,
        items: &[PlcAddress],
    ) -> Result<Vec<Result<VariableValue, String>>, ProtocolError> {
        let mut results = Vec::with_capacity(items.len());
        for chunk in split_by_pdu(items, self.pdu_size as usize) {
            let pdu_ref = self.next_ref();
            let response = self
                .exchange(&codec::read_var_request(pdu_ref, chunk))
                .await?;
            results.extend(codec::parse_read_response(&response, chunk)?);
        }
        Ok(results)
    }

    pub async fn write_item(
        &mut self,
        address: &PlcAddress,
        value: &VariableValue,
    ) -> Result<(), ProtocolError> {
        let payload = address.encode(value)?;
        let pdu_ref = self.next_ref();
        let response = self
            .exchange(&codec::write_var_request(pdu_ref, address, &payload))
            .await?;
        codec::parse_write_response(&response)
    }

    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// 请求和应答都不能超过协商的 PDU 长度
fn split_by_pdu(items: &[PlcAddress], pdu_size: usize) -> Vec<&[PlcAddress]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < items.len() {
        let mut request_len = READ_REQUEST_OVERHEAD;
        let mut response_len = READ_RESPONSE_OVERHEAD;
        let mut end = start;
        while end < items.len() && end - start < 20 {
            let data_len = items[end].data_type.byte_len();
            let next_request = request_len + READ_ITEM_SPEC_LEN;
            let next_response = response_len + READ_ITEM_HEADER_LEN + data_len + data_len % 2;
            if end > start && (next_request > pdu_size || next_response > pdu_size) {
                break;
            }
            request_len = next_request;
            response_len = next_response;
            end += 1;
        }
        chunks.push(&items[start..end]);
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::address::parse_address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    async fn read_frame(stream: &mut DuplexStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.expect("header");
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&header);
        stream.read_exact(&mut frame[4..]).await.expect("body");
        frame
    }

    /// 模拟 PLC：完成握手后对读请求返回一个 REAL 值
    async fn fake_plc(mut stream: DuplexStream) {
        let _cr = read_frame(&mut stream).await;
        let cc = [
            0x03, 0x00, 0x00, 0x16, 0x11, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A,
            0xC1, 0x02, 0x01, 0x00, 0xC2, 0x02, 0x03, 0x01,
        ];
        stream.write_all(&cc).await.expect("cc");

        let setup = read_frame(&mut stream).await;
        let pdu_ref = u16::from_be_bytes([setup[11], setup[12]]);
        let params = [0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0];
        stream
            .write_all(&codec::ack_frame(pdu_ref, &params, &[]))
            .await
            .expect("setup ack");

        let read = read_frame(&mut stream).await;
        let pdu_ref = u16::from_be_bytes([read[11], read[12]]);
        let mut data = vec![0xFF, 0x04, 0x00, 0x20];
        data.extend_from_slice(&21.5f32.to_be_bytes());
        stream
            .write_all(&codec::ack_frame(pdu_ref, &[0x04, 0x01], &data))
            .await
            .expect("read ack");
    }

    #[tokio::test]
    async fn handshake_then_read() {
        let (client_side, plc_side) = duplex(4096);
        let plc = tokio::spawn(fake_plc(plc_side));

        let mut client = S7Client::handshake(client_side, 0, 1, Duration::from_secs(1))
            .await
            .expect("handshake");
        assert_eq!(client.pdu_size(), 480);

        let address = parse_address("DB1.DBD0").expect("address");
        let values = client.read_items(&[address]).await.expect("read");
        assert_eq!(values, vec![Ok(VariableValue::F64(21.5))]);
        plc.await.expect("plc task");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_as_connection_loss() {
        let (client_side, _plc_side) = duplex(4096);
        let err = match S7Client::handshake(client_side, 0, 1, Duration::from_millis(500)).await {
            Ok(_) => panic!("handshake should time out"),
            Err(err) => err,
        };
        assert!(err.is_connection_loss());
    }

    #[test]
    fn split_respects_pdu_capacity() {
        let items: Vec<PlcAddress> = (0..30)
            .map(|i| parse_address(&format!("DB1.DBD{}", i * 4)).expect("address"))
            .collect();
        let chunks = split_by_pdu(&items, 240);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 30);
        for chunk in chunks {
            assert!(READ_REQUEST_OVERHEAD + chunk.len() * READ_ITEM_SPEC_LEN <= 240);
        }
    }
}
