//! 内存变量目录
//!
//! 以 `RwLock<BTreeMap>` 保存设备与变量，加载代数通过 watch 通道广播。

use crate::error::StorageError;
use crate::loader::load_catalog_file;
use crate::models::CatalogSnapshot;
use crate::traits::VariableCatalog;
use domain::{
    ConnectionState, Device, DeviceId, Protocol, Variable, VariableId, VariableValue,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use tokio::sync::watch;

#[derive(Default)]
struct CatalogState {
    devices: BTreeMap<DeviceId, Device>,
    variables: BTreeMap<VariableId, Variable>,
}

/// 内存变量目录
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    generation: watch::Sender<u64>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: RwLock::new(CatalogState::default()),
            generation,
        }
    }

    /// 以快照替换目录内容，返回新的加载代数。
    ///
    /// 仍存在的变量保留最新值与时间戳；设备保留连接状态投影。
    pub fn load(&self, snapshot: CatalogSnapshot) -> Result<u64, StorageError> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| StorageError::new("lock failed"))?;
            let mut devices = BTreeMap::new();
            for mut device in snapshot.devices {
                if let Some(previous) = state.devices.get(&device.id) {
                    device.connection_state = previous.connection_state;
                }
                devices.insert(device.id, device);
            }
            let mut variables = BTreeMap::new();
            for mut variable in snapshot.variables {
                if let Some(previous) = state.variables.get(&variable.id) {
                    if variable.value.is_none() {
                        variable.value = previous.value.clone();
                        variable.updated_at_ms = previous.updated_at_ms;
                    }
                }
                variables.insert(variable.id, variable);
            }
            state.devices = devices;
            state.variables = variables;
        }
        Ok(self.bump())
    }

    /// 重新读取目录文件并替换内容
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<u64, StorageError> {
        let snapshot = load_catalog_file(path)?;
        self.load(snapshot)
    }

    /// 新增或替换单个设备
    pub fn upsert_device(&self, device: Device) -> Result<u64, StorageError> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| StorageError::new("lock failed"))?;
            state.devices.insert(device.id, device);
        }
        Ok(self.bump())
    }

    /// 删除设备及其变量
    pub fn remove_device(&self, device_id: DeviceId) -> Result<u64, StorageError> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| StorageError::new("lock failed"))?;
            state.devices.remove(&device_id);
            state.variables.retain(|_, v| v.device_id != device_id);
        }
        Ok(self.bump())
    }

    /// 新增或替换单个变量
    pub fn upsert_variable(&self, variable: Variable) -> Result<u64, StorageError> {
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| StorageError::new("lock failed"))?;
            state.variables.insert(variable.id, variable);
        }
        Ok(self.bump())
    }

    /// 当前加载代数
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn bump(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VariableCatalog for InMemoryCatalog {
    async fn list_devices(&self, protocol: Protocol) -> Result<Vec<Device>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(state
            .devices
            .values()
            .filter(|device| device.protocol() == protocol)
            .cloned()
            .collect())
    }

    async fn find_device(&self, device_id: DeviceId) -> Result<Option<Device>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(state.devices.get(&device_id).cloned())
    }

    async fn list_variables(&self, protocol: Protocol) -> Result<Vec<Variable>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(state
            .variables
            .values()
            .filter(|variable| variable.protocol == protocol)
            .cloned()
            .collect())
    }

    async fn find_variable(
        &self,
        variable_id: VariableId,
    ) -> Result<Option<Variable>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(state.variables.get(&variable_id).cloned())
    }

    async fn apply_value(
        &self,
        variable_id: VariableId,
        value: &VariableValue,
        ts_ms: i64,
    ) -> Result<Option<Variable>, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        Ok(state.variables.get_mut(&variable_id).map(|variable| {
            variable.value = Some(value.clone());
            variable.updated_at_ms = Some(ts_ms);
            variable.clone()
        }))
    }

    async fn set_connection_state(
        &self,
        device_id: DeviceId,
        connection_state: ConnectionState,
    ) -> Result<(), StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        if let Some(device) = state.devices.get_mut(&device_id) {
            device.connection_state = connection_state;
        }
        Ok(())
    }

    fn load_signal(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
