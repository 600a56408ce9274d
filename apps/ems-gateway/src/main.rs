//! 采集网关进程：加载目录、启动引擎、输出引擎事件，Ctrl-C 优雅退出。

use domain::EngineEvent;
use ems_config::EngineConfig;
use ems_ingest::{Engine, EngineDeps};
use ems_pipeline::BusChannel;
use ems_storage::{InMemoryCatalog, TracingHistorySink};
use ems_telemetry::init_tracing;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = EngineConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    // 先读目录：文件错误直接退出，不启动任何连接
    let catalog = Arc::new(InMemoryCatalog::new());
    let generation = catalog.reload(&config.catalog_path)?;
    info!(
        target: "ems.ingest",
        path = %config.catalog_path.display(),
        generation,
        "catalog_loaded"
    );

    let engine = Engine::start(
        &config,
        EngineDeps {
            catalog: catalog.clone(),
            history: Arc::new(TracingHistorySink),
            opc_connector: ems_protocol::opc::default_connector(),
        },
    )?;
    // 界面外壳的替身：把引擎事件打到日志
    let console = tokio::spawn(event_console(engine.events()));

    wait_for_stop(&catalog, &config).await?;

    let report = engine.shutdown().await;
    if !report.is_clean() {
        warn!(
            target: "ems.ingest",
            services_stopped = report.services_stopped,
            devices_disconnected = report.devices_disconnected,
            "shutdown_incomplete"
        );
    }
    let _ = console.await;
    let metrics = ems_telemetry::metrics().snapshot();
    info!(
        target: "ems.ingest",
        values_processed = metrics.values_processed,
        outbound_published = metrics.outbound_published,
        loop_faults = metrics.loop_faults,
        "gateway_stopped"
    );
    Ok(())
}

/// 等待 Ctrl-C；Unix 下 SIGHUP 触发目录重新加载
#[cfg(unix)]
async fn wait_for_stop(
    catalog: &InMemoryCatalog,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = hangup.recv() => match catalog.reload(&config.catalog_path) {
                Ok(generation) => info!(target: "ems.ingest", generation, "catalog_reloaded"),
                Err(err) => warn!(target: "ems.ingest", error = %err, "catalog_reload_failed"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop(
    _catalog: &InMemoryCatalog,
    _config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// 通道关闭后返回
async fn event_console(events: Arc<BusChannel<EngineEvent>>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::ConnectionStateChanged {
                device_id,
                protocol,
                state,
                connected,
            } => info!(
                target: "ems.ingest",
                device_id,
                protocol = %protocol,
                state = ?state,
                connected,
                "connection_state_changed"
            ),
            EngineEvent::ValueChanged {
                variable_id,
                value,
                ts_ms,
            } => info!(
                target: "ems.ingest",
                variable_id,
                value = ?value,
                ts_ms,
                "value_changed"
            ),
        }
    }
}
