use ems_pipeline::BusError;
use ems_protocol::ProtocolError;
use ems_storage::StorageError;

/// 采集服务错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("catalog error: {0}")]
    Catalog(#[from] StorageError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("variable not found: {0}")]
    VariableNotFound(domain::VariableId),
}
