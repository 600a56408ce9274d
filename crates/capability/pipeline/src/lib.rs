//! # EMS Pipeline 模块
//!
//! - [`bus`]：按名称注册的有界通道（ChannelBus）
//! - [`pipeline`]：单消费者有序处理器链
//! - [`processors`]：内置处理器（校验、变化检测、写入、历史、事件、外发）
//! - [`outbound`]：外发消息队列与负载编码

pub mod bus;
pub mod context;
pub mod error;
pub mod outbound;
pub mod pipeline;
pub mod processor;
pub mod processors;

pub use bus::{BusChannel, ChannelBus, ENGINE_EVENTS_CHANNEL};
pub use context::ValueContext;
pub use error::{BusError, PipelineError};
pub use outbound::{
    OutboundQueue, OutboundReceiver, PendingOutboundMessage, encode_payload, outbound_queue,
};
pub use pipeline::{DataProcessingPipeline, ProcessOutcome, ValueReceiver, ValueSender, value_channel};
pub use processor::ValueProcessor;
pub use processors::{
    ChangeDetector, HistoryRecorder, OutboundForwarder, ValueChangedNotifier, ValueValidator,
    VariableWriter, standard_pipeline,
};
