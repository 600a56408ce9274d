//! 采集引擎装配与生命周期
//!
//! 引擎启动五个长期任务：PLC 轮询服务、OPC 重载/连接服务、MQTT 重载/连接服务、
//! 数据处理流水线消费循环、外发发布循环。
//!
//! 关闭顺序：
//! 1. 通知三个协议服务退出，等待当前轮询/连接完成
//! 2. 三个管理器并行断开全部设备（限时）
//! 3. 流水线关闭写端并读空队列
//! 4. 外发发布循环发完剩余消息
//! 5. 关闭 ChannelBus 上的全部通道

use crate::error::IngestError;
use crate::service::ProtocolService;
use domain::{EngineEvent, Protocol, VariableId, VariableValue};
use ems_config::EngineConfig;
use ems_pipeline::{
    BusChannel, ChannelBus, ENGINE_EVENTS_CHANNEL, OutboundQueue, outbound_queue,
    standard_pipeline, value_channel,
};
use ems_protocol::opc::OpcConnector;
use ems_protocol::{
    ManagerConfig, ManagerHooks, MqttConnectionFactory, MqttManager, MqttStrategy,
    OpcConnectionFactory, OpcManager, OpcStrategy, OutboundPublisher, PlcConnectionFactory,
    PlcManager, PlcStrategy, PollingScheduler, ProtocolConnectionManager, PublisherConfig,
    ReconnectPolicy, SchedulerConfig,
};
use ems_storage::{HistorySink, VariableCatalog};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// 引擎的外部协作方
#[derive(Clone)]
pub struct EngineDeps {
    pub catalog: Arc<dyn VariableCatalog>,
    pub history: Arc<dyn HistorySink>,
    pub opc_connector: Arc<dyn OpcConnector>,
}

/// 关闭结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 三个协议服务在时限内退出
    pub services_stopped: bool,
    /// 全部设备在时限内断开
    pub devices_disconnected: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.services_stopped && self.devices_disconnected
    }
}

pub struct Engine;

impl Engine {
    /// 装配并启动引擎（需要在 tokio 运行时内调用）
    pub fn start(config: &EngineConfig, deps: EngineDeps) -> Result<EngineHandle, IngestError> {
        let bus = Arc::new(ChannelBus::new());
        let events = bus.channel::<EngineEvent>(ENGINE_EVENTS_CHANNEL, config.event_channel_capacity)?;
        let (values, value_rx) = value_channel();
        let (outbound, outbound_rx) = outbound_queue();

        let manager_config = ManagerConfig {
            max_concurrent_connects: config.max_concurrent_connects,
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            reconnect: ReconnectPolicy::new(config.reconnect_max_delay()),
        };
        let hooks = ManagerHooks::new(values)
            .with_events(events.clone())
            .with_catalog(deps.catalog.clone());

        let plc: PlcManager = ProtocolConnectionManager::new(
            Arc::new(PlcStrategy {
                max_batch: config.plc_max_batch,
            }),
            Arc::new(PlcConnectionFactory::new(config.request_timeout())),
            manager_config.clone(),
            hooks.clone(),
        );
        let opc: OpcManager = ProtocolConnectionManager::new(
            Arc::new(OpcStrategy),
            Arc::new(OpcConnectionFactory::new(
                deps.opc_connector.clone(),
                config.connect_timeout(),
            )),
            manager_config.clone(),
            hooks.clone(),
        );
        let mqtt: MqttManager = ProtocolConnectionManager::new(
            Arc::new(MqttStrategy),
            Arc::new(MqttConnectionFactory::new(config.connect_timeout())),
            manager_config,
            hooks,
        );

        let cooldown = config.loop_cooldown();
        let plc_service = Arc::new(
            ProtocolService::new("plc", plc.clone(), deps.catalog.clone(), cooldown).with_scheduler(
                PollingScheduler::new(
                    plc.clone(),
                    SchedulerConfig {
                        sweep: config.poll_sweep(),
                    },
                ),
            ),
        );
        let opc_service = Arc::new(ProtocolService::new(
            "opc",
            opc.clone(),
            deps.catalog.clone(),
            cooldown,
        ));
        let mqtt_service = Arc::new(ProtocolService::new(
            "mqtt",
            mqtt.clone(),
            deps.catalog.clone(),
            cooldown,
        ));

        let pipeline = Arc::new(standard_pipeline(
            deps.catalog.clone(),
            deps.history.clone(),
            events.clone(),
            outbound.clone(),
        ));
        let publisher = Arc::new(OutboundPublisher::new(
            Arc::new(mqtt.clone()),
            PublisherConfig {
                batch_size: config.publish_batch_size,
                flush_interval: config.publish_flush_interval(),
                cooldown,
            },
        ));

        let (services_tx, services_rx) = watch::channel(false);
        let (pipeline_tx, pipeline_rx) = watch::channel(false);
        let (publisher_tx, publisher_rx) = watch::channel(false);

        let services = vec![
            ("plc", {
                let shutdown = services_rx.clone();
                tokio::spawn(async move { plc_service.run(shutdown).await })
            }),
            ("opc", {
                let shutdown = services_rx.clone();
                tokio::spawn(async move { opc_service.run(shutdown).await })
            }),
            ("mqtt", {
                let shutdown = services_rx;
                tokio::spawn(async move { mqtt_service.run(shutdown).await })
            }),
        ];
        let pipeline_task = tokio::spawn(async move { pipeline.run(value_rx, pipeline_rx).await });
        let publisher_task =
            tokio::spawn(async move { publisher.run(outbound_rx, publisher_rx).await });

        info!(
            target: "ems.ingest",
            max_concurrent_connects = config.max_concurrent_connects,
            poll_sweep_ms = config.poll_sweep_ms,
            publish_batch_size = config.publish_batch_size,
            "engine_started"
        );

        Ok(EngineHandle {
            bus,
            events,
            catalog: deps.catalog,
            outbound,
            plc,
            opc,
            mqtt,
            services_tx,
            pipeline_tx,
            publisher_tx,
            services,
            pipeline: pipeline_task,
            publisher: publisher_task,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }
}

/// 运行中的引擎
pub struct EngineHandle {
    bus: Arc<ChannelBus>,
    events: Arc<BusChannel<EngineEvent>>,
    catalog: Arc<dyn VariableCatalog>,
    outbound: OutboundQueue,
    plc: PlcManager,
    opc: OpcManager,
    mqtt: MqttManager,
    services_tx: watch::Sender<bool>,
    pipeline_tx: watch::Sender<bool>,
    publisher_tx: watch::Sender<bool>,
    services: Vec<(&'static str, JoinHandle<()>)>,
    pipeline: JoinHandle<()>,
    publisher: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl EngineHandle {
    /// 引擎事件通道（连接状态变化、变量值变化）
    pub fn events(&self) -> Arc<BusChannel<EngineEvent>> {
        self.events.clone()
    }

    pub fn bus(&self) -> &Arc<ChannelBus> {
        &self.bus
    }

    pub fn plc(&self) -> &PlcManager {
        &self.plc
    }

    pub fn opc(&self) -> &OpcManager {
        &self.opc
    }

    pub fn mqtt(&self) -> &MqttManager {
        &self.mqtt
    }

    /// 外发队列写端（界面侧的手动外发也走这里）
    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// 按变量写入设备：根据变量协议选择管理器
    pub async fn write_variable(
        &self,
        variable_id: VariableId,
        value: &VariableValue,
    ) -> Result<(), IngestError> {
        let variable = self
            .catalog
            .find_variable(variable_id)
            .await?
            .ok_or(IngestError::VariableNotFound(variable_id))?;
        match variable.protocol {
            Protocol::Plc => {
                self.plc
                    .write(variable.device_id, &variable.address, value)
                    .await?
            }
            Protocol::Opc => {
                self.opc
                    .write(variable.device_id, &variable.address, value)
                    .await?
            }
            Protocol::Mqtt => {
                self.mqtt
                    .write(variable.device_id, &variable.address, value)
                    .await?
            }
        }
        Ok(())
    }

    /// 优雅关闭，见模块文档中的关闭顺序
    pub async fn shutdown(self) -> ShutdownReport {
        let wait = self.shutdown_timeout;
        info!(target: "ems.ingest", wait_ms = wait.as_millis() as u64, "engine_stopping");
        let mut report = ShutdownReport::default();

        let _ = self.services_tx.send(true);
        let names: Vec<&'static str> = self.services.iter().map(|(name, _)| *name).collect();
        let aborts: Vec<_> = self
            .services
            .iter()
            .map(|(_, task)| task.abort_handle())
            .collect();
        match timeout(wait, join_all(self.services.into_iter().map(|(_, task)| task))).await {
            Ok(results) => {
                report.services_stopped = true;
                for (name, result) in names.iter().zip(results) {
                    if let Err(err) = result {
                        report.services_stopped = false;
                        warn!(target: "ems.ingest", service = name, error = %err, "service_task_failed");
                    }
                }
            }
            Err(_) => {
                warn!(target: "ems.ingest", "service_stop_timed_out");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        let (plc, opc, mqtt) = tokio::join!(
            self.plc.dispose(wait),
            self.opc.dispose(wait),
            self.mqtt.dispose(wait)
        );
        report.devices_disconnected = plc && opc && mqtt;

        let _ = self.pipeline_tx.send(true);
        if let Err(err) = self.pipeline.await {
            warn!(target: "ems.ingest", error = %err, "pipeline_task_failed");
        }
        let _ = self.publisher_tx.send(true);
        if let Err(err) = self.publisher.await {
            warn!(target: "ems.ingest", error = %err, "publisher_task_failed");
        }
        self.bus.close_all();

        info!(
            target: "ems.ingest",
            services_stopped = report.services_stopped,
            devices_disconnected = report.devices_disconnected,
            "engine_stopped"
        );
        report
    }
}
