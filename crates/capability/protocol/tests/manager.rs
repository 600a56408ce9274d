mod common;

use common::{FakeConnection, FakeFactory, opc_device, plc_device, variable};
use domain::{ConnectionState, EngineEvent, PollingInterval, Protocol, VariableValue};
use ems_pipeline::{ChannelBus, ENGINE_EVENTS_CHANNEL, value_channel};
use ems_protocol::{
    ConnectionEvent, ManagerConfig, ManagerHooks, OpcStrategy, PlcStrategy,
    ProtocolConnectionManager, ProtocolError, ProtocolStrategy,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn manager_with(
    strategy: Arc<dyn ProtocolStrategy>,
    factory: Arc<FakeFactory>,
    hooks: ManagerHooks,
) -> ProtocolConnectionManager<FakeConnection> {
    ProtocolConnectionManager::new(strategy, factory, ManagerConfig::default(), hooks)
}

fn plc_manager(factory: Arc<FakeFactory>) -> ProtocolConnectionManager<FakeConnection> {
    let (values, _rx) = value_channel();
    manager_with(
        Arc::new(PlcStrategy::default()),
        factory,
        ManagerHooks::new(values),
    )
}

#[tokio::test]
async fn inactive_device_is_never_connected() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory.clone());
    manager.add_device(plc_device(1, false)).await.expect("add");

    assert!(!manager.connect(1).await);
    assert_eq!(manager.connect_active().await, 0);
    assert_eq!(manager.connect_many(&[1]).await, 0);
    assert_eq!(factory.state(1).connects(), 0);
    assert!(!manager.is_connected(1));
}

#[tokio::test]
async fn adding_same_device_twice_updates_in_place() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory.clone());
    manager.add_device(plc_device(1, true)).await.expect("add");
    let first = manager.context(1).expect("ctx");

    let mut renamed = plc_device(1, true);
    renamed.name = "renamed".to_string();
    manager.add_device(renamed).await.expect("add again");

    assert_eq!(manager.device_ids(), vec![1]);
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    let second = manager.context(1).expect("ctx");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.device().name, "renamed");
}

#[tokio::test]
async fn device_of_other_protocol_is_rejected() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory);
    let err = manager.add_device(opc_device(2)).await.expect_err("wrong protocol");
    assert!(matches!(err, ProtocolError::Unsupported(_)));
}

#[tokio::test]
async fn clearing_then_setting_variables_matches_fresh_grouping() {
    let vars = vec![
        variable(10, 1, Protocol::Plc, "DB1.DBD0", PollingInterval::Ms100),
        variable(11, 1, Protocol::Plc, "DB1.DBD4", PollingInterval::Sec5),
        variable(12, 1, Protocol::Plc, "DB1.DBD8", PollingInterval::Ms100),
    ];

    let reused = plc_manager(Arc::new(FakeFactory::default()));
    reused.add_device(plc_device(1, true)).await.expect("add");
    reused.update_variables(1, Vec::new()).await.expect("clear");
    reused.update_variables(1, vars.clone()).await.expect("set");

    let fresh = plc_manager(Arc::new(FakeFactory::default()));
    fresh.add_device(plc_device(1, true)).await.expect("add");
    fresh.update_variables(1, vars).await.expect("set");

    let reused_groups = reused.context(1).expect("ctx").variables().groups().clone();
    let fresh_groups = fresh.context(1).expect("ctx").variables().groups().clone();
    assert_eq!(reused_groups, fresh_groups);
    assert_eq!(reused_groups.len(), 2);
    assert_eq!(reused_groups.variable_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_retries_with_backoff_and_resets() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory.clone());
    manager.add_device(plc_device(1, true)).await.expect("add");
    let state = factory.state(1);
    state.fail_connect.store(true, Ordering::SeqCst);

    assert!(!manager.connect(1).await);
    let ctx = manager.context(1).expect("ctx");
    assert_eq!(ctx.reconnect_attempts(), 1);
    assert_eq!(ctx.state(), ConnectionState::Failed);

    // 第一次重试在 1s 后，仍然失败；第二次在其后 2s
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(state.connects(), 2);
    assert_eq!(ctx.reconnect_attempts(), 2);

    state.fail_connect.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(state.connects(), 3);
    assert!(manager.is_connected(1));
    assert_eq!(ctx.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn protocol_disconnect_event_triggers_reconnect() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory.clone());
    manager.add_device(plc_device(1, true)).await.expect("add");
    assert!(manager.connect(1).await);

    let state = factory.state(1);
    state.push(ConnectionEvent::Disconnected {
        reason: "peer reset".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!manager.is_connected(1));
    assert_eq!(state.disconnects.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(manager.is_connected(1));
    assert_eq!(state.connects(), 2);
}

#[tokio::test]
async fn pushed_values_are_enqueued_per_matching_variable() {
    let factory = Arc::new(FakeFactory::default());
    let (values, mut rx) = value_channel();
    let manager = manager_with(
        Arc::new(PlcStrategy::default()),
        factory.clone(),
        ManagerHooks::new(values),
    );
    manager.add_device(plc_device(1, true)).await.expect("add");
    let mut inactive = variable(11, 1, Protocol::Plc, "MW2", PollingInterval::Sec1);
    inactive.is_active = false;
    manager
        .update_variables(
            1,
            vec![
                variable(10, 1, Protocol::Plc, "MW0", PollingInterval::Sec1),
                inactive,
            ],
        )
        .await
        .expect("vars");
    assert!(manager.connect(1).await);

    let state = factory.state(1);
    state.push(ConnectionEvent::ValueChanged {
        address: "MW2".to_string(),
        value: VariableValue::I64(1),
        ts_ms: 5,
    });
    state.push(ConnectionEvent::ValueChanged {
        address: "MW0".to_string(),
        value: VariableValue::I64(7),
        ts_ms: 6,
    });

    let ctx = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("in time")
        .expect("value");
    assert_eq!(ctx.variable_id, 10);
    assert_eq!(ctx.device_id, 1);
    assert_eq!(ctx.value, VariableValue::I64(7));
    assert_eq!(ctx.ts_ms, 6);
    assert!(rx.try_recv().is_none());
}

#[tokio::test]
async fn connection_state_changes_reach_the_event_bus() {
    let bus = ChannelBus::new();
    let events = bus
        .channel::<EngineEvent>(ENGINE_EVENTS_CHANNEL, 16)
        .expect("channel");
    let (values, _rx) = value_channel();
    let manager = manager_with(
        Arc::new(PlcStrategy::default()),
        Arc::new(FakeFactory::default()),
        ManagerHooks::new(values).with_events(events.clone()),
    );
    manager.add_device(plc_device(3, true)).await.expect("add");
    assert!(manager.connect(3).await);
    assert!(manager.disconnect(3).await);
    assert!(!manager.disconnect(3).await);

    let mut states = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(50), events.recv()).await
    {
        if let EngineEvent::ConnectionStateChanged {
            device_id,
            state,
            connected,
            ..
        } = event
        {
            assert_eq!(device_id, 3);
            assert_eq!(connected, state == ConnectionState::Connected);
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn subscribed_devices_resubscribe_on_variable_changes() {
    let factory = Arc::new(FakeFactory::default());
    let (values, _rx) = value_channel();
    let manager = manager_with(
        Arc::new(OpcStrategy),
        factory.clone(),
        ManagerHooks::new(values),
    );
    manager.add_device(opc_device(5)).await.expect("add");
    manager
        .update_variables(
            5,
            vec![
                variable(1, 5, Protocol::Opc, "ns=2;s=a", PollingInterval::Ms500),
                variable(2, 5, Protocol::Opc, "ns=2;s=b", PollingInterval::Sec1),
            ],
        )
        .await
        .expect("vars");
    assert!(manager.connect(5).await);

    let state = factory.state(5);
    {
        let subscribes = state.subscribes.lock().expect("subscribes");
        assert_eq!(subscribes.len(), 1);
        let mut intervals: Vec<u64> = subscribes[0]
            .iter()
            .map(|request| request.publishing_interval_ms)
            .collect();
        intervals.sort_unstable();
        assert_eq!(intervals, vec![500, 1000]);
    }

    manager
        .update_variables(
            5,
            vec![variable(1, 5, Protocol::Opc, "ns=2;s=a", PollingInterval::Ms500)],
        )
        .await
        .expect("shrink");
    let unsubscribes = state.unsubscribes.lock().expect("unsubscribes");
    assert_eq!(unsubscribes.as_slice(), &[vec!["ns=2;s=b".to_string()]]);
}

#[tokio::test]
async fn write_requires_a_connected_device() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory.clone());
    manager.add_device(plc_device(1, true)).await.expect("add");

    let err = manager
        .write(1, "MW0", &VariableValue::I64(3))
        .await
        .expect_err("not connected");
    assert!(matches!(err, ProtocolError::NotConnected(1)));

    assert!(manager.connect(1).await);
    manager
        .write(1, "MW0", &VariableValue::I64(3))
        .await
        .expect("write");
    assert_eq!(
        factory.state(1).writes.lock().expect("writes").as_slice(),
        &[("MW0".to_string(), VariableValue::I64(3))]
    );
}

#[tokio::test]
async fn dispose_disconnects_everything_and_stops_connecting() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory.clone());
    for id in 1..=3 {
        manager.add_device(plc_device(id, true)).await.expect("add");
    }
    assert_eq!(manager.connect_active().await, 3);

    assert!(manager.dispose(Duration::from_secs(10)).await);
    assert!(manager.is_disposed());
    for id in 1..=3 {
        assert!(!manager.is_connected(id));
        assert_eq!(factory.state(id).disconnects.load(Ordering::SeqCst), 1);
    }
    assert!(!manager.connect(1).await);
}

#[tokio::test]
async fn removing_a_device_disconnects_it() {
    let factory = Arc::new(FakeFactory::default());
    let manager = plc_manager(factory.clone());
    manager.add_device(plc_device(1, true)).await.expect("add");
    assert!(manager.connect(1).await);

    assert!(manager.remove_device(1).await);
    assert!(!manager.remove_device(1).await);
    assert!(manager.context(1).is_none());
    assert_eq!(factory.state(1).disconnects.load(Ordering::SeqCst), 1);
}
