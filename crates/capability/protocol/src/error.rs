//! 协议错误类型定义

use domain::DeviceId;

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 连接错误
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// PLC 报文错误
    #[error("s7 error: {0}")]
    S7(String),

    /// 地址解析错误
    #[error("invalid address: {0}")]
    Address(String),

    /// OPC UA 服务错误
    #[error("opc error: {0}")]
    Opc(String),

    /// MQTT 错误
    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// 数据解析错误
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 设备未连接
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),

    /// 设备不存在
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    /// 协议不支持该操作
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}

impl ProtocolError {
    /// 是否表示物理连接已断开（需要转入断线重连）
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ProtocolError::Connection(_)
                | ProtocolError::Io(_)
                | ProtocolError::NotConnected(_)
                | ProtocolError::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_loss() {
        assert!(ProtocolError::Connection("reset".into()).is_connection_loss());
        assert!(
            ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
                .is_connection_loss()
        );
        assert!(!ProtocolError::Timeout("read".into()).is_connection_loss());
        assert!(!ProtocolError::Address("DBX".into()).is_connection_loss());
    }
}
