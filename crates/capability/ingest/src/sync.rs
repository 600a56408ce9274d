//! 目录 → 管理器同步
//!
//! 以目录为准：新设备加入、已有设备原地更新、目录中已删除的设备移出管理器，
//! 每个设备的变量集合整体替换。

use crate::error::IngestError;
use domain::{DeviceId, Variable};
use ems_protocol::{DeviceConnection, ProtocolConnectionManager};
use ems_storage::VariableCatalog;
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// 一次同步的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
    pub variables: usize,
}

/// 把目录中该管理器协议的设备与变量同步到管理器。
///
/// 单个设备失败只记录日志，不影响其他设备；目录读取失败返回错误。
pub async fn sync_manager<C: DeviceConnection>(
    manager: &ProtocolConnectionManager<C>,
    catalog: &dyn VariableCatalog,
) -> Result<SyncReport, IngestError> {
    let protocol = manager.strategy().protocol();
    let devices = catalog.list_devices(protocol).await?;
    let variables = catalog.list_variables(protocol).await?;

    let mut by_device: HashMap<DeviceId, Vec<Variable>> = HashMap::new();
    for variable in variables {
        by_device.entry(variable.device_id).or_default().push(variable);
    }

    let known: HashSet<DeviceId> = manager.device_ids().into_iter().collect();
    let mut listed = HashSet::with_capacity(devices.len());
    let mut report = SyncReport::default();

    for device in devices {
        let device_id = device.id;
        listed.insert(device_id);
        let variables = by_device.remove(&device_id).unwrap_or_default();
        if let Err(err) = manager.add_device(device).await {
            warn!(target: "ems.ingest", device_id, error = %err, "device_sync_failed");
            report.failed += 1;
            continue;
        }
        if known.contains(&device_id) {
            report.updated += 1;
        } else {
            report.added += 1;
        }
        report.variables += variables.len();
        if let Err(err) = manager.update_variables(device_id, variables).await {
            warn!(target: "ems.ingest", device_id, error = %err, "variable_sync_failed");
            report.failed += 1;
        }
    }

    for device_id in known.difference(&listed) {
        if manager.remove_device(*device_id).await {
            report.removed += 1;
        }
    }

    // 变量指向目录中不存在的设备
    for (device_id, variables) in by_device {
        warn!(
            target: "ems.ingest",
            device_id,
            variables = variables.len(),
            "orphan_variables_skipped"
        );
    }
    Ok(report)
}
