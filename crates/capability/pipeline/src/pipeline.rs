//! 数据处理流水线
//!
//! 单消费者从无界 FIFO 队列取值，按注册顺序执行处理器。生产者写入永不阻塞。

use crate::context::ValueContext;
use crate::processor::ValueProcessor;
use domain::{DeviceId, VariableId, VariableValue};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// 流水线入队端（可克隆，多生产者）
#[derive(Clone)]
pub struct ValueSender {
    tx: mpsc::UnboundedSender<ValueContext>,
}

impl ValueSender {
    /// 非阻塞入队；队列已关闭时返回 false。
    pub fn enqueue(&self, ctx: ValueContext) -> bool {
        match self.tx.send(ctx) {
            Ok(()) => {
                ems_telemetry::record_values_enqueued();
                true
            }
            Err(_) => {
                tracing::debug!(target: "ems.pipeline", "value_queue_closed");
                false
            }
        }
    }

    pub fn enqueue_value(
        &self,
        variable_id: VariableId,
        device_id: DeviceId,
        value: VariableValue,
        ts_ms: i64,
    ) -> bool {
        self.enqueue(ValueContext::new(variable_id, device_id, value, ts_ms))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 流水线消费端
pub struct ValueReceiver {
    rx: mpsc::UnboundedReceiver<ValueContext>,
}

impl ValueReceiver {
    pub async fn recv(&mut self) -> Option<ValueContext> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ValueContext> {
        self.rx.try_recv().ok()
    }
}

/// 创建流水线队列
pub fn value_channel() -> (ValueSender, ValueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ValueSender { tx }, ValueReceiver { rx })
}

/// 单条处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// 全部处理器执行完毕
    Completed { modified: bool },
    /// 某处理器标记 handled
    ShortCircuited { by: &'static str },
    /// 某处理器返回错误或 panic，当前条目被放弃
    Failed { by: &'static str, error: String },
}

/// 有序处理器链
#[derive(Default)]
pub struct DataProcessingPipeline {
    processors: Vec<Arc<dyn ValueProcessor>>,
}

impl DataProcessingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processor(mut self, processor: Arc<dyn ValueProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// 处理单个条目
    pub async fn process(&self, ctx: &mut ValueContext) -> ProcessOutcome {
        for processor in &self.processors {
            let name = processor.name();
            let result = AssertUnwindSafe(processor.process(ctx)).catch_unwind().await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("processor panicked".to_string()),
            };
            if let Some(error) = error {
                ems_telemetry::record_processor_failures();
                tracing::warn!(
                    target: "ems.pipeline",
                    processor = name,
                    variable_id = ctx.variable_id,
                    error = %error,
                    "processor_failed"
                );
                return ProcessOutcome::Failed { by: name, error };
            }
            if ctx.handled {
                ems_telemetry::record_values_short_circuited();
                tracing::debug!(
                    target: "ems.pipeline",
                    processor = name,
                    variable_id = ctx.variable_id,
                    reason = ctx.reason.as_deref().unwrap_or(""),
                    "value_short_circuited"
                );
                return ProcessOutcome::ShortCircuited { by: name };
            }
        }
        ems_telemetry::record_values_processed();
        ProcessOutcome::Completed {
            modified: ctx.modified,
        }
    }

    /// 消费循环：收到关闭信号后关闭写端，读空队列再返回。
    pub async fn run(&self, mut receiver: ValueReceiver, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            target: "ems.pipeline",
            processors = ?self.processor_names(),
            "pipeline_started"
        );
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                item = receiver.rx.recv() => match item {
                    Some(mut ctx) => {
                        self.process(&mut ctx).await;
                    }
                    None => {
                        tracing::info!(target: "ems.pipeline", "pipeline_queue_closed");
                        return;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        receiver.rx.close();
        let mut drained = 0usize;
        while let Some(mut ctx) = receiver.rx.recv().await {
            self.process(&mut ctx).await;
            drained += 1;
        }
        tracing::info!(target: "ems.pipeline", drained, "pipeline_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        name: &'static str,
        calls: AtomicUsize,
        short_circuit: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CountingProcessor {
        fn new(name: &'static str, short_circuit: bool, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                calls: AtomicUsize::new(0),
                short_circuit,
                log,
            }
        }
    }

    #[async_trait]
    impl ValueProcessor for CountingProcessor {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().expect("log").push(self.name);
            if self.short_circuit {
                ctx.short_circuit("stop");
            }
            Ok(())
        }
    }

    struct PanickingProcessor;

    #[async_trait]
    impl ValueProcessor for PanickingProcessor {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn process(&self, ctx: &mut ValueContext) -> Result<(), PipelineError> {
            if ctx.variable_id == 1 {
                panic!("boom");
            }
            Ok(())
        }
    }

    fn sample(variable_id: i64) -> ValueContext {
        ValueContext::new(variable_id, 1, VariableValue::I64(1), 1_000)
    }

    #[tokio::test]
    async fn processors_run_in_order_and_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(CountingProcessor::new("first", false, log.clone()));
        let second = Arc::new(CountingProcessor::new("second", true, log.clone()));
        let third = Arc::new(CountingProcessor::new("third", false, log.clone()));
        let pipeline = DataProcessingPipeline::new()
            .with_processor(first.clone())
            .with_processor(second.clone())
            .with_processor(third.clone());

        let outcome = pipeline.process(&mut sample(7)).await;
        assert_eq!(outcome, ProcessOutcome::ShortCircuited { by: "second" });
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
        assert_eq!(log.lock().expect("log").as_slice(), &["first", "second"]);
    }

    #[tokio::test]
    async fn panic_abandons_item_but_not_next() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tail = Arc::new(CountingProcessor::new("tail", false, log));
        let pipeline = DataProcessingPipeline::new()
            .with_processor(Arc::new(PanickingProcessor))
            .with_processor(tail.clone());

        let failed = pipeline.process(&mut sample(1)).await;
        assert!(matches!(failed, ProcessOutcome::Failed { by: "panicking", .. }));
        assert_eq!(tail.calls.load(Ordering::SeqCst), 0);

        let ok = pipeline.process(&mut sample(2)).await;
        assert_eq!(ok, ProcessOutcome::Completed { modified: false });
        assert_eq!(tail.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_drains_queue_after_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(CountingProcessor::new("count", false, log));
        let pipeline = DataProcessingPipeline::new().with_processor(counter.clone());
        let (sender, receiver) = value_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for id in 0..5 {
            assert!(sender.enqueue(sample(id)));
        }
        shutdown_tx.send_replace(true);
        pipeline.run(receiver, shutdown_rx).await;

        assert_eq!(counter.calls.load(Ordering::SeqCst), 5);
        assert!(!sender.enqueue(sample(9)));
    }
}
