//! 采集引擎运行配置加载。

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 引擎运行配置：进程启动时构造一次，显式传入各管理器。
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub catalog_path: PathBuf,
    pub max_concurrent_connects: usize,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub poll_sweep_ms: u64,
    pub plc_max_batch: usize,
    pub reconnect_max_delay_secs: u64,
    pub publish_batch_size: usize,
    pub publish_flush_ms: u64,
    pub loop_cooldown_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("catalog.json"),
            max_concurrent_connects: 10,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 3_000,
            poll_sweep_ms: 20,
            plc_max_batch: 10,
            reconnect_max_delay_secs: 60,
            publish_batch_size: 50,
            publish_flush_ms: 1_000,
            loop_cooldown_ms: 5_000,
            shutdown_timeout_ms: 10_000,
            event_channel_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// 从环境变量读取配置，未设置的项使用默认值。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let catalog_path = env::var("EMS_CATALOG_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.catalog_path);
        let max_concurrent_connects = read_usize_with_default(
            "EMS_MAX_CONCURRENT_CONNECTS",
            defaults.max_concurrent_connects,
        )?;
        let connect_timeout_ms =
            read_u64_with_default("EMS_CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?;
        let request_timeout_ms =
            read_u64_with_default("EMS_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?;
        let poll_sweep_ms = read_u64_with_default("EMS_POLL_SWEEP_MS", defaults.poll_sweep_ms)?;
        let plc_max_batch = read_usize_with_default("EMS_PLC_MAX_BATCH", defaults.plc_max_batch)?;
        let reconnect_max_delay_secs = read_u64_with_default(
            "EMS_RECONNECT_MAX_DELAY_SECS",
            defaults.reconnect_max_delay_secs,
        )?;
        let publish_batch_size =
            read_usize_with_default("EMS_PUBLISH_BATCH_SIZE", defaults.publish_batch_size)?;
        let publish_flush_ms =
            read_u64_with_default("EMS_PUBLISH_FLUSH_MS", defaults.publish_flush_ms)?;
        let loop_cooldown_ms =
            read_u64_with_default("EMS_LOOP_COOLDOWN_MS", defaults.loop_cooldown_ms)?;
        let shutdown_timeout_ms =
            read_u64_with_default("EMS_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout_ms)?;
        let event_channel_capacity = read_usize_with_default(
            "EMS_EVENT_CHANNEL_CAPACITY",
            defaults.event_channel_capacity,
        )?;

        let config = Self {
            catalog_path,
            max_concurrent_connects,
            connect_timeout_ms,
            request_timeout_ms,
            poll_sweep_ms,
            plc_max_batch,
            reconnect_max_delay_secs,
            publish_batch_size,
            publish_flush_ms,
            loop_cooldown_ms,
            shutdown_timeout_ms,
            event_channel_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// 零值会让许可、批次或定时器失效，统一拒绝。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("EMS_MAX_CONCURRENT_CONNECTS", self.max_concurrent_connects as u64),
            ("EMS_CONNECT_TIMEOUT_MS", self.connect_timeout_ms),
            ("EMS_REQUEST_TIMEOUT_MS", self.request_timeout_ms),
            ("EMS_POLL_SWEEP_MS", self.poll_sweep_ms),
            ("EMS_PLC_MAX_BATCH", self.plc_max_batch as u64),
            ("EMS_RECONNECT_MAX_DELAY_SECS", self.reconnect_max_delay_secs),
            ("EMS_PUBLISH_BATCH_SIZE", self.publish_batch_size as u64),
            ("EMS_PUBLISH_FLUSH_MS", self.publish_flush_ms),
            ("EMS_EVENT_CHANNEL_CAPACITY", self.event_channel_capacity as u64),
        ];
        for (key, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(key.to_string(), "0".to_string()));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_sweep(&self) -> Duration {
        Duration::from_millis(self.poll_sweep_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }

    pub fn publish_flush_interval(&self) -> Duration {
        Duration::from_millis(self.publish_flush_ms)
    }

    pub fn loop_cooldown(&self) -> Duration {
        Duration::from_millis(self.loop_cooldown_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_number_is_reported_with_key() {
        unsafe {
            std::env::set_var("EMS_TEST_ONLY_BAD_U64", "abc");
        }
        let err = read_u64_with_default("EMS_TEST_ONLY_BAD_U64", 1).expect_err("invalid");
        assert_eq!(err.to_string(), "invalid value for EMS_TEST_ONLY_BAD_U64: abc");
    }

    #[test]
    fn zero_batch_is_rejected() {
        let config = EngineConfig {
            publish_batch_size: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().expect_err("zero batch");
        assert!(err.to_string().contains("EMS_PUBLISH_BATCH_SIZE"));
    }
}
