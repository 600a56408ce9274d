//! 历史写入实现

use crate::error::StorageError;
use crate::traits::HistorySink;
use domain::{VariableId, VariableValue};
use std::sync::Mutex;

/// 历史记录条目
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub variable_id: VariableId,
    pub value: VariableValue,
    pub ts_ms: i64,
}

/// 内存历史存储
pub struct InMemoryHistorySink {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl InMemoryHistorySink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// 读取全部条目（用于测试）
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryHistorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HistorySink for InMemoryHistorySink {
    async fn append(
        &self,
        variable_id: VariableId,
        value: &VariableValue,
        ts_ms: i64,
    ) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::new("lock failed"))?;
        entries.push(HistoryEntry {
            variable_id,
            value: value.clone(),
            ts_ms,
        });
        Ok(())
    }
}

/// 只输出日志的历史写入（网关进程默认使用）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHistorySink;

#[async_trait::async_trait]
impl HistorySink for TracingHistorySink {
    async fn append(
        &self,
        variable_id: VariableId,
        value: &VariableValue,
        ts_ms: i64,
    ) -> Result<(), StorageError> {
        tracing::debug!(
            target: "ems.storage",
            variable_id,
            value = %value,
            ts_ms,
            "history_appended"
        );
        Ok(())
    }
}
