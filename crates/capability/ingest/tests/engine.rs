use domain::{
    ConnectionState, Device, DeviceEndpoint, EngineEvent, OpcEndpoint, PlcEndpoint,
    PollingInterval, Protocol, Variable, VariableValue,
};
use ems_config::EngineConfig;
use ems_ingest::{Engine, EngineDeps, IngestError};
use ems_protocol::ProtocolError;
use ems_protocol::opc::UnavailableConnector;
use ems_storage::{CatalogSnapshot, InMemoryCatalog, InMemoryHistorySink};
use std::sync::Arc;
use std::time::Duration;

fn config() -> EngineConfig {
    EngineConfig {
        loop_cooldown_ms: 50,
        shutdown_timeout_ms: 1_000,
        ..EngineConfig::default()
    }
}

fn snapshot(opc_active: bool) -> CatalogSnapshot {
    CatalogSnapshot {
        devices: vec![
            Device {
                id: 1,
                name: "press".to_string(),
                endpoint: DeviceEndpoint::Plc(PlcEndpoint {
                    ip: "127.0.0.1".to_string(),
                    port: 102,
                    rack: 0,
                    slot: 1,
                }),
                is_active: false,
                connection_state: ConnectionState::Disconnected,
            },
            Device {
                id: 2,
                name: "line-server".to_string(),
                endpoint: DeviceEndpoint::Opc(OpcEndpoint {
                    server_url: "opc.tcp://127.0.0.1:4840".to_string(),
                    username: None,
                    password: None,
                }),
                is_active: opc_active,
                connection_state: ConnectionState::Disconnected,
            },
        ],
        variables: vec![Variable {
            id: 10,
            device_id: 1,
            protocol: Protocol::Plc,
            address: "DB1.DBD0".to_string(),
            polling_interval: PollingInterval::Ms100,
            is_active: true,
            value: None,
            updated_at_ms: None,
            alarm_enabled: false,
            history_enabled: true,
            outbound: None,
        }],
    }
}

fn deps(catalog: Arc<InMemoryCatalog>) -> EngineDeps {
    EngineDeps {
        catalog,
        history: Arc::new(InMemoryHistorySink::new()),
        opc_connector: Arc::new(UnavailableConnector),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn engine_syncs_catalog_and_stops_cleanly() {
    let catalog = Arc::new(InMemoryCatalog::new());
    let engine = Engine::start(&config(), deps(catalog.clone())).expect("start");

    catalog.load(snapshot(false)).expect("load");
    wait_until(|| engine.plc().device_ids() == vec![1] && engine.opc().device_ids() == vec![2])
        .await;
    assert!(engine.mqtt().device_ids().is_empty());
    assert!(!engine.plc().is_connected(1));

    let report = engine.shutdown().await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn writes_are_routed_by_variable_protocol() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.load(snapshot(false)).expect("load");
    let engine = Engine::start(&config(), deps(catalog)).expect("start");
    wait_until(|| engine.plc().device_ids() == vec![1]).await;

    let err = engine
        .write_variable(99, &VariableValue::I64(1))
        .await
        .expect_err("unknown variable");
    assert!(matches!(err, IngestError::VariableNotFound(99)));

    let err = engine
        .write_variable(10, &VariableValue::F64(1.5))
        .await
        .expect_err("device inactive");
    assert!(matches!(
        err,
        IngestError::Protocol(ProtocolError::NotConnected(1))
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn failed_connect_is_reported_on_the_event_channel() {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog.load(snapshot(true)).expect("load");
    let engine = Engine::start(&config(), deps(catalog)).expect("start");
    let events = engine.events();

    let mut states = Vec::new();
    while states.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        if let EngineEvent::ConnectionStateChanged {
            device_id: 2,
            state,
            connected,
            ..
        } = event
        {
            assert!(!connected);
            states.push(state);
        }
    }
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Failed]);

    let report = engine.shutdown().await;
    assert!(report.devices_disconnected);
}
