//! 追踪初始化与进程级计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub connect_attempts: u64,
    pub connect_success: u64,
    pub connect_failure: u64,
    pub reconnect_scheduled: u64,
    pub poll_reads: u64,
    pub poll_read_failures: u64,
    pub values_enqueued: u64,
    pub values_processed: u64,
    pub values_short_circuited: u64,
    pub processor_failures: u64,
    pub history_appends: u64,
    pub history_failures: u64,
    pub outbound_published: u64,
    pub outbound_dropped: u64,
    pub loop_faults: u64,
}

/// 进程级计数指标。
pub struct TelemetryMetrics {
    connect_attempts: AtomicU64,
    connect_success: AtomicU64,
    connect_failure: AtomicU64,
    reconnect_scheduled: AtomicU64,
    poll_reads: AtomicU64,
    poll_read_failures: AtomicU64,
    values_enqueued: AtomicU64,
    values_processed: AtomicU64,
    values_short_circuited: AtomicU64,
    processor_failures: AtomicU64,
    history_appends: AtomicU64,
    history_failures: AtomicU64,
    outbound_published: AtomicU64,
    outbound_dropped: AtomicU64,
    loop_faults: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connect_success: AtomicU64::new(0),
            connect_failure: AtomicU64::new(0),
            reconnect_scheduled: AtomicU64::new(0),
            poll_reads: AtomicU64::new(0),
            poll_read_failures: AtomicU64::new(0),
            values_enqueued: AtomicU64::new(0),
            values_processed: AtomicU64::new(0),
            values_short_circuited: AtomicU64::new(0),
            processor_failures: AtomicU64::new(0),
            history_appends: AtomicU64::new(0),
            history_failures: AtomicU64::new(0),
            outbound_published: AtomicU64::new(0),
            outbound_dropped: AtomicU64::new(0),
            loop_faults: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_success: self.connect_success.load(Ordering::Relaxed),
            connect_failure: self.connect_failure.load(Ordering::Relaxed),
            reconnect_scheduled: self.reconnect_scheduled.load(Ordering::Relaxed),
            poll_reads: self.poll_reads.load(Ordering::Relaxed),
            poll_read_failures: self.poll_read_failures.load(Ordering::Relaxed),
            values_enqueued: self.values_enqueued.load(Ordering::Relaxed),
            values_processed: self.values_processed.load(Ordering::Relaxed),
            values_short_circuited: self.values_short_circuited.load(Ordering::Relaxed),
            processor_failures: self.processor_failures.load(Ordering::Relaxed),
            history_appends: self.history_appends.load(Ordering::Relaxed),
            history_failures: self.history_failures.load(Ordering::Relaxed),
            outbound_published: self.outbound_published.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            loop_faults: self.loop_faults.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info，`RUST_LOG` 覆盖）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录连接尝试次数。
pub fn record_connect_attempts() {
    metrics().connect_attempts.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接成功次数。
pub fn record_connect_success() {
    metrics().connect_success.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接失败次数（超时、认证、不可达）。
pub fn record_connect_failure() {
    metrics().connect_failure.fetch_add(1, Ordering::Relaxed);
}

/// 记录已排程的退避重连次数。
pub fn record_reconnect_scheduled() {
    metrics().reconnect_scheduled.fetch_add(1, Ordering::Relaxed);
}

/// 记录轮询批量读取次数。
pub fn record_poll_reads() {
    metrics().poll_reads.fetch_add(1, Ordering::Relaxed);
}

/// 记录轮询批量读取失败次数。
pub fn record_poll_read_failures() {
    metrics().poll_read_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录进入流水线队列的值数量。
pub fn record_values_enqueued() {
    metrics().values_enqueued.fetch_add(1, Ordering::Relaxed);
}

/// 记录流水线完整处理的值数量。
pub fn record_values_processed() {
    metrics().values_processed.fetch_add(1, Ordering::Relaxed);
}

/// 记录被处理器短路的值数量。
pub fn record_values_short_circuited() {
    metrics().values_short_circuited.fetch_add(1, Ordering::Relaxed);
}

/// 记录处理器失败次数（当前条目被放弃）。
pub fn record_processor_failures() {
    metrics().processor_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录历史写入成功次数。
pub fn record_history_appends() {
    metrics().history_appends.fetch_add(1, Ordering::Relaxed);
}

/// 记录历史写入失败次数。
pub fn record_history_failures() {
    metrics().history_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录外发发布成功的消息数量。
pub fn record_outbound_published() {
    metrics().outbound_published.fetch_add(1, Ordering::Relaxed);
}

/// 记录外发丢弃的消息数量（Broker 未连接或发布失败）。
pub fn record_outbound_dropped() {
    metrics().outbound_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录循环边界捕获的意外故障次数。
pub fn record_loop_faults() {
    metrics().loop_faults.fetch_add(1, Ordering::Relaxed);
}

/// 批量累加（一次发布多条消息时使用）。
pub fn record_outbound_published_n(count: u64) {
    metrics()
        .outbound_published
        .fetch_add(count, Ordering::Relaxed);
}

/// 批量累加丢弃数。
pub fn record_outbound_dropped_n(count: u64) {
    metrics().outbound_dropped.fetch_add(count, Ordering::Relaxed);
}
