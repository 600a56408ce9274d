/// 流水线处理错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("processor {0} failed: {1}")]
    Processor(&'static str, String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("queue closed")]
    Closed,
}

impl From<ems_storage::StorageError> for PipelineError {
    fn from(err: ems_storage::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// ChannelBus 错误。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("channel {0} is registered with another message type")]
    TypeMismatch(String),
    #[error("channel {0} is full")]
    Full(String),
    #[error("channel {0} is closed")]
    Closed(String),
}
