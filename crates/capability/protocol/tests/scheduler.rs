mod common;

use common::{FakeConnection, FakeFactory, plc_device, variable};
use domain::{PollingInterval, Protocol};
use ems_pipeline::value_channel;
use ems_protocol::{
    ManagerConfig, ManagerHooks, PlcStrategy, PollingScheduler, ProtocolConnectionManager,
    SchedulerConfig,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

async fn scheduler(
    factory: Arc<FakeFactory>,
    max_batch: usize,
) -> PollingScheduler<FakeConnection> {
    let (values, _rx) = value_channel();
    let manager = ProtocolConnectionManager::new(
        Arc::new(PlcStrategy { max_batch }),
        factory,
        ManagerConfig::default(),
        ManagerHooks::new(values),
    );
    PollingScheduler::new(manager, SchedulerConfig::default())
}

#[tokio::test]
async fn group_cadence_follows_interval_not_sweep_period() {
    let factory = Arc::new(FakeFactory::default());
    let scheduler = scheduler(factory.clone(), 10).await;
    let manager = scheduler.manager();
    manager.add_device(plc_device(1, true)).await.expect("add");
    manager
        .update_variables(
            1,
            vec![
                variable(10, 1, Protocol::Plc, "DB1.DBD0", PollingInterval::Ms100),
                variable(11, 1, Protocol::Plc, "DB1.DBD4", PollingInterval::Sec5),
            ],
        )
        .await
        .expect("vars");
    assert!(manager.connect(1).await);

    // 20ms 扫描周期下模拟 5100ms
    let start = Instant::now();
    for k in 0..=255u64 {
        scheduler.sweep(start + Duration::from_millis(k * 20)).await;
    }

    let batches = factory.state(1).read_batches();
    let fast = batches.iter().filter(|b| b.contains(&"DB1.DBD0".to_string())).count();
    let slow = batches.iter().filter(|b| b.contains(&"DB1.DBD4".to_string())).count();
    assert!(fast >= 50, "fast group polled {} times", fast);
    assert_eq!(fast, 52);
    assert_eq!(slow, 2);
}

#[tokio::test]
async fn group_reads_are_split_by_batch_limit() {
    let factory = Arc::new(FakeFactory::default());
    let scheduler = scheduler(factory.clone(), 3).await;
    let manager = scheduler.manager();
    manager.add_device(plc_device(1, true)).await.expect("add");
    let vars = (0..7)
        .map(|i| {
            variable(
                100 + i,
                1,
                Protocol::Plc,
                &format!("DB1.DBW{}", i * 2),
                PollingInterval::Sec1,
            )
        })
        .collect();
    manager.update_variables(1, vars).await.expect("vars");
    assert!(manager.connect(1).await);

    let report = scheduler.sweep(Instant::now()).await;
    assert_eq!(report.reads, 3);
    assert_eq!(report.groups_polled, 1);
    assert_eq!(report.values, 7);
    let sizes: Vec<usize> = factory
        .state(1)
        .read_batches()
        .iter()
        .map(|b| b.len())
        .collect();
    assert_eq!(sizes, vec![3, 3, 1]);
}

#[tokio::test]
async fn read_failure_only_affects_its_own_device() {
    let factory = Arc::new(FakeFactory::default());
    let scheduler = scheduler(factory.clone(), 10).await;
    let manager = scheduler.manager();
    for id in [1, 2] {
        manager.add_device(plc_device(id, true)).await.expect("add");
        manager
            .update_variables(
                id,
                vec![variable(id * 10, id, Protocol::Plc, "MW0", PollingInterval::Sec1)],
            )
            .await
            .expect("vars");
        assert!(manager.connect(id).await);
    }
    factory.state(1).fail_reads.store(true, Ordering::SeqCst);

    let now = Instant::now();
    let report = scheduler.sweep(now).await;
    assert_eq!(report.devices, 2);
    assert_eq!(report.failed_reads, 1);
    assert_eq!(report.values, 1);
    // 连接类错误：设备转为断开，等待退避重连
    assert!(!manager.is_connected(1));
    assert!(manager.is_connected(2));

    // 失败组没有记为已轮询，恢复后立即重试
    factory.state(1).fail_reads.store(false, Ordering::SeqCst);
    assert!(manager.connect(1).await);
    let report = scheduler.sweep(now + Duration::from_millis(10)).await;
    assert_eq!(report.devices, 2);
    assert_eq!(report.groups_polled, 1);
}

#[tokio::test]
async fn late_sweeps_do_not_push_the_schedule_back() {
    let factory = Arc::new(FakeFactory::default());
    let scheduler = scheduler(factory.clone(), 10).await;
    let manager = scheduler.manager();
    manager.add_device(plc_device(1, true)).await.expect("add");
    manager
        .update_variables(
            1,
            vec![variable(10, 1, Protocol::Plc, "DB1.DBD0", PollingInterval::Ms100)],
        )
        .await
        .expect("vars");
    assert!(manager.connect(1).await);

    // 每次扫描都比理想时刻晚 5ms，累计不应丢周期
    let start = Instant::now();
    let mut polled = 0;
    for k in 0..=255u64 {
        let report = scheduler
            .sweep(start + Duration::from_millis(k * 20 + 5))
            .await;
        polled += report.groups_polled;
    }
    assert_eq!(polled, 52);

    // 落后超过一个周期时从当前时刻重新起算，不补发
    let resumed = start + Duration::from_millis(10_000);
    assert_eq!(scheduler.sweep(resumed).await.groups_polled, 1);
    assert_eq!(
        scheduler
            .sweep(resumed + Duration::from_millis(50))
            .await
            .groups_polled,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn run_keeps_group_cadence_with_slow_reads() {
    let factory = Arc::new(FakeFactory::default());
    let scheduler = Arc::new(scheduler(factory.clone(), 10).await);
    let manager = scheduler.manager();
    manager.add_device(plc_device(1, true)).await.expect("add");
    manager
        .update_variables(
            1,
            vec![
                variable(10, 1, Protocol::Plc, "DB1.DBD0", PollingInterval::Ms100),
                variable(11, 1, Protocol::Plc, "DB1.DBD4", PollingInterval::Sec5),
            ],
        )
        .await
        .expect("vars");
    assert!(manager.connect(1).await);
    factory.state(1).read_delay_ms.store(3, Ordering::SeqCst);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(shutdown_rx).await }
    });
    tokio::time::sleep(Duration::from_millis(5100)).await;
    shutdown_tx.send(true).expect("signal");
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("stopped in time")
        .expect("join");

    let batches = factory.state(1).read_batches();
    let fast = batches.iter().filter(|b| b.contains(&"DB1.DBD0".to_string())).count();
    let slow = batches.iter().filter(|b| b.contains(&"DB1.DBD4".to_string())).count();
    assert!(fast >= 50, "fast group polled {} times", fast);
    assert!((1..=2).contains(&slow), "slow group polled {} times", slow);
}

#[tokio::test(start_paused = true)]
async fn run_stops_on_shutdown() {
    let factory = Arc::new(FakeFactory::default());
    let scheduler = Arc::new(scheduler(factory, 10).await);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(shutdown_rx).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).expect("signal");
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("stopped in time")
        .expect("join");
}
