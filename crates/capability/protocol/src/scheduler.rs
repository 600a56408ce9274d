//! 轮询调度器（PLC 路径）
//!
//! 单一协作循环：每个扫描周期检查所有已连接设备的轮询组是否到期。实际读取频率由
//! 各组的到期检查决定，扫描周期只决定调度抖动上限。

use crate::connection::DeviceConnection;
use crate::manager::{DevicePollReport, ProtocolConnectionManager};
use futures::FutureExt;
use futures::future::join_all;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// 调度参数
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// 扫描周期
    pub sweep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep: Duration::from_millis(20),
        }
    }
}

/// 一次扫描的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub devices: usize,
    pub groups_polled: usize,
    pub reads: usize,
    pub failed_reads: usize,
    pub values: usize,
    pub faults: usize,
}

impl SweepReport {
    fn absorb(&mut self, device: DevicePollReport) {
        self.devices += 1;
        self.groups_polled += device.groups_polled;
        self.reads += device.reads;
        self.failed_reads += device.failed_reads;
        self.values += device.values;
    }
}

pub struct PollingScheduler<C: DeviceConnection> {
    manager: ProtocolConnectionManager<C>,
    config: SchedulerConfig,
}

impl<C: DeviceConnection> PollingScheduler<C> {
    pub fn new(manager: ProtocolConnectionManager<C>, config: SchedulerConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &ProtocolConnectionManager<C> {
        &self.manager
    }

    /// 以 `now` 为基准扫描一次。设备之间并行，单设备异常不影响其他设备。
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let contexts: Vec<_> = self
            .manager
            .contexts()
            .into_iter()
            .filter(|ctx| ctx.is_connected())
            .collect();
        let polls = contexts.iter().map(|ctx| {
            let manager = &self.manager;
            async move {
                let device_id = ctx.device_id();
                let result = AssertUnwindSafe(manager.poll_device(ctx, now))
                    .catch_unwind()
                    .await;
                if result.is_err() {
                    ems_telemetry::record_loop_faults();
                    tracing::error!(target: "ems.protocol", device_id, "device_poll_panicked");
                }
                result.ok()
            }
        });
        let mut report = SweepReport::default();
        for outcome in join_all(polls).await {
            match outcome {
                Some(device) => report.absorb(device),
                None => report.faults += 1,
            }
        }
        report
    }

    /// 扫描循环，直到收到关闭信号。当前扫描完成后才退出。
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            target: "ems.protocol",
            sweep_ms = self.config.sweep.as_millis() as u64,
            "polling_scheduler_started"
        );
        let mut ticker = tokio::time::interval(self.config.sweep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow_and_update() {
                break;
            }
            self.sweep(Instant::now()).await;
        }
        tracing::info!(target: "ems.protocol", "polling_scheduler_stopped");
    }
}
