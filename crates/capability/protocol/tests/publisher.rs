use async_trait::async_trait;
use domain::{DeviceId, VariableValue};
use ems_pipeline::{PendingOutboundMessage, outbound_queue};
use ems_protocol::{OutboundPublisher, OutboundSink, ProtocolError, PublishReport, PublisherConfig};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Default)]
struct FakeSink {
    connected: HashSet<DeviceId>,
    failing: HashSet<DeviceId>,
    /// 每次 publish 调用收到的 (broker, 条数)
    calls: Mutex<Vec<(DeviceId, usize)>>,
    published: Mutex<Vec<PendingOutboundMessage>>,
}

impl FakeSink {
    fn connected(ids: &[DeviceId]) -> Self {
        Self {
            connected: ids.iter().copied().collect(),
            ..Default::default()
        }
    }

    fn published_count(&self) -> usize {
        self.published.lock().expect("published").len()
    }
}

#[async_trait]
impl OutboundSink for FakeSink {
    fn is_connected(&self, broker_id: DeviceId) -> bool {
        self.connected.contains(&broker_id)
    }

    async fn publish(
        &self,
        broker_id: DeviceId,
        messages: &[PendingOutboundMessage],
    ) -> Result<usize, ProtocolError> {
        self.calls
            .lock()
            .expect("calls")
            .push((broker_id, messages.len()));
        if self.failing.contains(&broker_id) {
            return Err(ProtocolError::Connection("broker gone".to_string()));
        }
        self.published
            .lock()
            .expect("published")
            .extend_from_slice(messages);
        Ok(messages.len())
    }
}

fn message(broker_id: DeviceId, n: i64) -> PendingOutboundMessage {
    PendingOutboundMessage::for_alias(broker_id, "plant/out", "flow", &VariableValue::I64(n), n)
}

fn config() -> PublisherConfig {
    PublisherConfig {
        batch_size: 50,
        flush_interval: Duration::from_millis(100),
        cooldown: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn disconnected_broker_group_is_dropped() {
    let sink = Arc::new(FakeSink::connected(&[1]));
    let publisher = OutboundPublisher::new(sink.clone(), config());

    let report = publisher
        .publish_batch(vec![message(1, 1), message(2, 2), message(1, 3)])
        .await;

    assert_eq!(
        report,
        PublishReport {
            published: 2,
            dropped: 1,
        }
    );
    assert_eq!(sink.calls.lock().expect("calls").as_slice(), &[(1, 2)]);
}

#[tokio::test]
async fn publish_error_drops_only_that_group() {
    let sink = Arc::new(FakeSink {
        connected: [1, 2].into_iter().collect(),
        failing: [2].into_iter().collect(),
        ..Default::default()
    });
    let publisher = OutboundPublisher::new(sink.clone(), config());

    let report = publisher
        .publish_batch(vec![message(2, 1), message(1, 2)])
        .await;

    assert_eq!(report.published, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(sink.published_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn queue_is_drained_in_bounded_batches() {
    let sink = Arc::new(FakeSink::connected(&[1]));
    let publisher = Arc::new(OutboundPublisher::new(sink.clone(), config()));
    let (queue, receiver) = outbound_queue();
    for n in 0..120 {
        assert!(queue.enqueue(message(1, n)));
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.run(receiver, shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.published_count(), 120);
    let calls = sink.calls.lock().expect("calls").clone();
    assert!(calls.iter().all(|(_, count)| *count <= 50));
    assert_eq!(
        calls.iter().map(|(_, count)| count).sum::<usize>(),
        120
    );

    shutdown_tx.send(true).expect("shutdown");
    task.await.expect("publisher task");
}

#[tokio::test(start_paused = true)]
async fn shutdown_publishes_what_is_left() {
    let sink = Arc::new(FakeSink::connected(&[1]));
    let publisher = OutboundPublisher::new(sink.clone(), config());
    let (queue, receiver) = outbound_queue();
    for n in 0..75 {
        queue.enqueue(message(1, n));
    }
    // 关闭信号已置位：循环不再等待，直接收尾
    let (_shutdown_tx, shutdown_rx) = watch::channel(true);

    publisher.run(receiver, shutdown_rx).await;

    assert_eq!(sink.published_count(), 75);
    assert_eq!(
        sink.calls.lock().expect("calls").as_slice(),
        &[(1, 50), (1, 25)]
    );
    // 接收端已关闭，之后的入队失败
    assert!(!queue.enqueue(message(1, 99)));
}

#[tokio::test(start_paused = true)]
async fn single_message_is_published_without_waiting_for_a_full_batch() {
    let sink = Arc::new(FakeSink::connected(&[1]));
    let publisher = Arc::new(OutboundPublisher::new(sink.clone(), config()));
    let (queue, receiver) = outbound_queue();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = {
        let publisher = publisher.clone();
        tokio::spawn(async move { publisher.run(receiver, shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.enqueue(message(1, 7));
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(sink.published_count(), 1);

    shutdown_tx.send(true).expect("shutdown");
    task.await.expect("publisher task");
}
