//! 协议服务循环
//!
//! 每个协议一个长期运行的服务：等待目录加载信号，同步设备与变量后连接所有激活设备。
//! PLC 服务在同一任务内并行运行轮询调度器。

use crate::error::IngestError;
use crate::sync::{SyncReport, sync_manager};
use ems_protocol::{DeviceConnection, PollingScheduler, ProtocolConnectionManager};
use ems_storage::VariableCatalog;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 一次重新加载的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub sync: SyncReport,
    pub connected: usize,
}

pub struct ProtocolService<C: DeviceConnection> {
    name: &'static str,
    manager: ProtocolConnectionManager<C>,
    catalog: Arc<dyn VariableCatalog>,
    scheduler: Option<PollingScheduler<C>>,
    cooldown: Duration,
}

impl<C: DeviceConnection> ProtocolService<C> {
    pub fn new(
        name: &'static str,
        manager: ProtocolConnectionManager<C>,
        catalog: Arc<dyn VariableCatalog>,
        cooldown: Duration,
    ) -> Self {
        Self {
            name,
            manager,
            catalog,
            scheduler: None,
            cooldown,
        }
    }

    /// 附带轮询调度器（PLC）
    pub fn with_scheduler(mut self, scheduler: PollingScheduler<C>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn manager(&self) -> &ProtocolConnectionManager<C> {
        &self.manager
    }

    /// 同步目录并连接激活设备
    pub async fn reload(&self) -> Result<ReloadReport, IngestError> {
        let sync = sync_manager(&self.manager, self.catalog.as_ref()).await?;
        let connected = self.manager.connect_active().await;
        Ok(ReloadReport { sync, connected })
    }

    /// 服务主循环，直到收到关闭信号
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        match &self.scheduler {
            Some(scheduler) => {
                tokio::join!(self.reload_loop(shutdown.clone()), scheduler.run(shutdown));
            }
            None => self.reload_loop(shutdown).await,
        }
    }

    async fn reload_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut loads = self.catalog.load_signal();
        info!(target: "ems.ingest", service = self.name, "service_started");
        let mut retry = false;
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let generation = *loads.borrow_and_update();
            if generation > 0 || retry {
                retry = !self.guarded_reload(generation).await;
                if retry {
                    // 冷却后重试，期间仍响应关闭
                    tokio::select! {
                        _ = tokio::time::sleep(self.cooldown) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
            }
            tokio::select! {
                changed = loads.changed() => {
                    if changed.is_err() {
                        // 目录已释放，只等关闭
                        let _ = shutdown.wait_for(|stop| *stop).await;
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(target: "ems.ingest", service = self.name, "service_stopped");
    }

    /// 执行一次重新加载；错误与异常都在这里收住，返回是否成功
    async fn guarded_reload(&self, generation: u64) -> bool {
        match AssertUnwindSafe(self.reload()).catch_unwind().await {
            Ok(Ok(report)) => {
                info!(
                    target: "ems.ingest",
                    service = self.name,
                    generation,
                    added = report.sync.added,
                    updated = report.sync.updated,
                    removed = report.sync.removed,
                    variables = report.sync.variables,
                    connected = report.connected,
                    "catalog_synced"
                );
                true
            }
            Ok(Err(err)) => {
                warn!(
                    target: "ems.ingest",
                    service = self.name,
                    generation,
                    error = %err,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "catalog_sync_failed"
                );
                false
            }
            Err(_) => {
                ems_telemetry::record_loop_faults();
                error!(
                    target: "ems.ingest",
                    service = self.name,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "service_loop_fault"
                );
                false
            }
        }
    }
}
