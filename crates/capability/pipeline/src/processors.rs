//! 内置处理器
//!
//! 注册顺序：校验 → 变化检测 → 写入 → 历史 → 值变化事件 → 外发。
//! 未变化的值在写入阶段之后短路。

use crate::bus::BusChannel;
use crate::context::ValueContext;
use crate::error::{BusError, PipelineError};
use crate::outbound::{OutboundQueue, PendingOutboundMessage};
use crate::pipeline::DataProcessingPipeline;
use crate::processor::ValueProcessor;
use async_trait::async_trait;
use domain::{DeviceEndpoint, EngineEvent, VariableValue};
use ems_storage::{HistorySink, VariableCatalog};
use std::sync::Arc;

/// 值校验：非有限浮点数、非正时间戳直接短路。
#[derive(Debug, Default, Clone)]
pub struct ValueValidator {
    /// 超过该时长的旧值视为过期（None 表示不检查）
    pub max_age_ms: Option<i64>,
}

#[async_trait]
impl ValueProcessor for ValueValidator {
    fn name(&self) -> &'static str {
        "value_validator"
    }

    async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
        if let Some(reason) = validate_value(&ctx.value, ctx.ts_ms, self.max_age_ms) {
            ctx.short_circuit(reason);
        }
        Ok(())
    }
}

fn validate_value(value: &VariableValue, ts_ms: i64, max_age_ms: Option<i64>) -> Option<&'static str> {
    if ts_ms <= 0 {
        return Some("invalid_ts");
    }
    if let VariableValue::F64(v) = value {
        if !v.is_finite() {
            return Some("invalid_value");
        }
    }
    if let Some(max_age) = max_age_ms {
        if domain::now_epoch_ms().saturating_sub(ts_ms) > max_age {
            return Some("stale");
        }
    }
    None
}

/// 变化检测：唯一设置 `modified` 的阶段。
///
/// 未知或未激活变量在此短路；与当前值相同的观测值不置 `modified`，
/// 继续交给写入阶段刷新时间戳。
pub struct ChangeDetector {
    catalog: Arc<dyn VariableCatalog>,
}

impl ChangeDetector {
    pub fn new(catalog: Arc<dyn VariableCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ValueProcessor for ChangeDetector {
    fn name(&self) -> &'static str {
        "change_detector"
    }

    async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
        let Some(variable) = self.catalog.find_variable(ctx.variable_id).await? else {
            ctx.short_circuit("unknown_variable");
            return Ok(());
        };
        if !variable.is_active {
            ctx.short_circuit("inactive_variable");
            return Ok(());
        }
        let unchanged = variable
            .value
            .as_ref()
            .map(|current| current.same_as(&ctx.value))
            .unwrap_or(false);
        ctx.variable = Some(variable);
        ctx.modified = !unchanged;
        Ok(())
    }
}

/// 变量写入：变量最新值与时间戳的唯一写入方。
///
/// 未变化的值只刷新时间戳，随后短路，不产生历史、事件和外发。
pub struct VariableWriter {
    catalog: Arc<dyn VariableCatalog>,
}

impl VariableWriter {
    pub fn new(catalog: Arc<dyn VariableCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ValueProcessor for VariableWriter {
    fn name(&self) -> &'static str {
        "variable_writer"
    }

    async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
        match self
            .catalog
            .apply_value(ctx.variable_id, &ctx.value, ctx.ts_ms)
            .await?
        {
            Some(variable) => ctx.variable = Some(variable),
            None => {
                ctx.short_circuit("variable_removed");
                return Ok(());
            }
        }
        if !ctx.modified {
            ctx.short_circuit("unchanged");
        }
        Ok(())
    }
}

/// 历史记录：变量开启历史时追加，失败只记录日志。
pub struct HistoryRecorder {
    sink: Arc<dyn HistorySink>,
}

impl HistoryRecorder {
    pub fn new(sink: Arc<dyn HistorySink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ValueProcessor for HistoryRecorder {
    fn name(&self) -> &'static str {
        "history_recorder"
    }

    async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
        let enabled = ctx
            .variable
            .as_ref()
            .map(|variable| variable.history_enabled)
            .unwrap_or(false);
        if !enabled {
            return Ok(());
        }
        match self.sink.append(ctx.variable_id, &ctx.value, ctx.ts_ms).await {
            Ok(()) => ems_telemetry::record_history_appends(),
            Err(err) => {
                ems_telemetry::record_history_failures();
                tracing::warn!(
                    target: "ems.pipeline",
                    variable_id = ctx.variable_id,
                    error = %err,
                    "history_append_failed"
                );
            }
        }
        Ok(())
    }
}

/// 值变化事件：非阻塞写入事件通道，满时丢弃。
pub struct ValueChangedNotifier {
    events: Arc<BusChannel<EngineEvent>>,
}

impl ValueChangedNotifier {
    pub fn new(events: Arc<BusChannel<EngineEvent>>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl ValueProcessor for ValueChangedNotifier {
    fn name(&self) -> &'static str {
        "value_changed_notifier"
    }

    async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
        let event = EngineEvent::ValueChanged {
            variable_id: ctx.variable_id,
            value: ctx.value.clone(),
            ts_ms: ctx.ts_ms,
        };
        match self.events.try_send(event) {
            Ok(()) | Err(BusError::Closed(_)) => {}
            Err(err) => {
                tracing::debug!(
                    target: "ems.pipeline",
                    variable_id = ctx.variable_id,
                    error = %err,
                    "engine_event_dropped"
                );
            }
        }
        Ok(())
    }
}

/// 外发转发：变量绑定了外发别名时放入外发队列。
pub struct OutboundForwarder {
    catalog: Arc<dyn VariableCatalog>,
    queue: OutboundQueue,
}

impl OutboundForwarder {
    pub fn new(catalog: Arc<dyn VariableCatalog>, queue: OutboundQueue) -> Self {
        Self { catalog, queue }
    }
}

#[async_trait]
impl ValueProcessor for OutboundForwarder {
    fn name(&self) -> &'static str {
        "outbound_forwarder"
    }

    async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
        let Some(binding) = ctx.variable.as_ref().and_then(|v| v.outbound.clone()) else {
            return Ok(());
        };
        let topic = match self.catalog.find_device(binding.broker_id).await? {
            Some(device) => match device.endpoint {
                DeviceEndpoint::Mqtt(endpoint) => endpoint.publish_topic,
                _ => {
                    tracing::warn!(
                        target: "ems.pipeline",
                        variable_id = ctx.variable_id,
                        broker_id = binding.broker_id,
                        "outbound_broker_not_mqtt"
                    );
                    return Ok(());
                }
            },
            None => {
                tracing::warn!(
                    target: "ems.pipeline",
                    variable_id = ctx.variable_id,
                    broker_id = binding.broker_id,
                    "outbound_broker_missing"
                );
                return Ok(());
            }
        };
        let message = PendingOutboundMessage::for_alias(
            binding.broker_id,
            topic,
            &binding.alias,
            &ctx.value,
            ctx.ts_ms,
        );
        if !self.queue.enqueue(message) {
            tracing::debug!(target: "ems.pipeline", variable_id = ctx.variable_id, "outbound_queue_closed");
        }
        Ok(())
    }
}

/// 按标准顺序装配内置处理器
pub fn standard_pipeline(
    catalog: Arc<dyn VariableCatalog>,
    history: Arc<dyn HistorySink>,
    events: Arc<BusChannel<EngineEvent>>,
    outbound: OutboundQueue,
) -> DataProcessingPipeline {
    DataProcessingPipeline::new()
        .with_processor(Arc::new(ValueValidator::default()))
        .with_processor(Arc::new(ChangeDetector::new(catalog.clone())))
        .with_processor(Arc::new(VariableWriter::new(catalog.clone())))
        .with_processor(Arc::new(HistoryRecorder::new(history)))
        .with_processor(Arc::new(ValueChangedNotifier::new(events)))
        .with_processor(Arc::new(OutboundForwarder::new(catalog, outbound)))
}
