//! 通用协议连接管理器
//!
//! 每个协议一个实例，持有 device id → DeviceContext 映射：
//! - 并发连接数由信号量限制（唯一的阻塞等待点）
//! - 连接、断开、重连生命周期
//! - 连接事件泵把入站数据变化交给流水线
//!
//! 协议差异（轮询/订阅/推送、批量上限）由 [`ProtocolStrategy`] 提供。

use crate::connection::{
    ConnectionEvent, ConnectionEventReceiver, ConnectionEventSender, ConnectionFactory,
    DeviceConnection,
};
use crate::error::ProtocolError;
use crate::poll_group::VariableSet;
use crate::reconnect::{ReconnectPolicy, ReconnectState};
use crate::strategy::{AcquisitionMode, ProtocolStrategy};
use domain::{
    ConnectionState, Device, DeviceId, EngineEvent, PollingInterval, Variable, VariableId,
    VariableValue,
};
use ems_pipeline::{BusChannel, BusError, PendingOutboundMessage, ValueSender};
use ems_storage::VariableCatalog;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// 管理器参数
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent_connects: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connects: 10,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// 管理器的下游协作方
#[derive(Clone)]
pub struct ManagerHooks {
    /// 流水线入队端
    pub values: ValueSender,
    /// 引擎事件通道（连接状态变化）
    pub events: Option<Arc<BusChannel<EngineEvent>>>,
    /// 连接状态投影写回目录
    pub catalog: Option<Arc<dyn VariableCatalog>>,
}

impl ManagerHooks {
    pub fn new(values: ValueSender) -> Self {
        Self {
            values,
            events: None,
            catalog: None,
        }
    }

    pub fn with_events(mut self, events: Arc<BusChannel<EngineEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn VariableCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ContextTasks {
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

/// 单设备运行时上下文：设备快照 + 连接 + 变量集合 + 连接状态
pub struct DeviceContext<C> {
    device_id: DeviceId,
    device: RwLock<Device>,
    connection: tokio::sync::Mutex<C>,
    events_tx: ConnectionEventSender,
    variables: RwLock<Arc<VariableSet>>,
    connected: AtomicBool,
    state: Mutex<ConnectionState>,
    reconnect: ReconnectState,
    reconnect_pending: AtomicBool,
    last_polled: Mutex<HashMap<PollingInterval, Instant>>,
    tasks: Mutex<ContextTasks>,
}

impl<C: DeviceConnection> DeviceContext<C> {
    fn new(device: Device, connection: C, events_tx: ConnectionEventSender) -> Self {
        Self {
            device_id: device.id,
            device: RwLock::new(device),
            connection: tokio::sync::Mutex::new(connection),
            events_tx,
            variables: RwLock::new(Arc::new(VariableSet::default())),
            connected: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Disconnected),
            reconnect: ReconnectState::default(),
            reconnect_pending: AtomicBool::new(false),
            last_polled: Mutex::new(HashMap::new()),
            tasks: Mutex::new(ContextTasks::default()),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn device(&self) -> Device {
        read_lock(&self.device).clone()
    }

    pub fn is_active(&self) -> bool {
        read_lock(&self.device).is_active
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts()
    }

    pub fn variables(&self) -> Arc<VariableSet> {
        read_lock(&self.variables).clone()
    }

    /// 设备连接（同一设备的往返在此互斥串行）
    pub fn connection(&self) -> &tokio::sync::Mutex<C> {
        &self.connection
    }

    fn set_device(&self, device: Device) {
        *write_lock(&self.device) = device;
    }

    fn replace_variables(&self, variables: VariableSet) -> Arc<VariableSet> {
        std::mem::replace(&mut *write_lock(&self.variables), Arc::new(variables))
    }

    fn swap_state(&self, state: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *lock(&self.state), state)
    }

    /// 已到期的轮询组
    pub(crate) fn due_groups(&self, now: Instant) -> Vec<(PollingInterval, Vec<VariableId>)> {
        let variables = self.variables();
        let last_polled = lock(&self.last_polled);
        variables
            .groups()
            .iter()
            .filter(|(interval, _)| match last_polled.get(interval) {
                Some(last) => now.saturating_duration_since(*last) >= interval.as_duration(),
                None => true,
            })
            .map(|(interval, ids)| (interval, ids.to_vec()))
            .collect()
    }

    /// 按计划节拍记录轮询时刻：落后不足一个周期时沿用计划时刻，避免扫描延迟累积；
    /// 落后超过一个周期（如重连后）则从 `now` 重新起算。
    pub(crate) fn mark_polled(&self, interval: PollingInterval, now: Instant) {
        let period = interval.as_duration();
        let mut last_polled = lock(&self.last_polled);
        let anchored = match last_polled.get(&interval) {
            Some(previous) => {
                let scheduled = *previous + period;
                if now >= scheduled && now.duration_since(scheduled) < period {
                    scheduled
                } else {
                    now
                }
            }
            None => now,
        };
        last_polled.insert(interval, anchored);
    }

    fn clear_last_polled(&self) {
        lock(&self.last_polled).clear();
    }

    fn retain_last_polled(&self, intervals: &[PollingInterval]) {
        lock(&self.last_polled).retain(|interval, _| intervals.contains(interval));
    }

    fn set_pump(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.tasks).pump.replace(handle) {
            previous.abort();
        }
    }

    fn set_reconnect_task(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).reconnect = Some(handle);
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = lock(&self.tasks).reconnect.take() {
            handle.abort();
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);
    }

    fn abort_tasks(&self) {
        let mut tasks = lock(&self.tasks);
        if let Some(handle) = tasks.pump.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.reconnect.take() {
            handle.abort();
        }
    }
}

/// 单设备一次轮询的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevicePollReport {
    pub groups_polled: usize,
    pub reads: usize,
    pub failed_reads: usize,
    pub values: usize,
}

struct ManagerInner<C: DeviceConnection> {
    strategy: Arc<dyn ProtocolStrategy>,
    factory: Arc<dyn ConnectionFactory<C>>,
    config: ManagerConfig,
    hooks: ManagerHooks,
    devices: RwLock<HashMap<DeviceId, Arc<DeviceContext<C>>>>,
    permits: Semaphore,
    reconnect_tx: mpsc::UnboundedSender<(DeviceId, Duration)>,
    closed: AtomicBool,
}

/// 协议连接管理器（可克隆，克隆共享同一组设备上下文）
pub struct ProtocolConnectionManager<C: DeviceConnection> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: DeviceConnection> Clone for ProtocolConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: DeviceConnection> ProtocolConnectionManager<C> {
    /// 创建管理器并启动重连调度任务（需要在 tokio 运行时内调用）
    pub fn new(
        strategy: Arc<dyn ProtocolStrategy>,
        factory: Arc<dyn ConnectionFactory<C>>,
        config: ManagerConfig,
        hooks: ManagerHooks,
    ) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let permits = Semaphore::new(config.max_concurrent_connects.max(1));
        let inner = Arc::new(ManagerInner {
            strategy,
            factory,
            config,
            hooks,
            devices: RwLock::new(HashMap::new()),
            permits,
            reconnect_tx,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(reconnect_loop(Arc::downgrade(&inner), reconnect_rx));
        Self { inner }
    }

    pub fn strategy(&self) -> &Arc<dyn ProtocolStrategy> {
        &self.inner.strategy
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// 新增设备；同一设备重复新增时原地更新设备快照
    pub async fn add_device(&self, device: Device) -> Result<(), ProtocolError> {
        let protocol = self.inner.strategy.protocol();
        if device.protocol() != protocol {
            return Err(ProtocolError::Unsupported(format!(
                "device {} is {}, manager handles {}",
                device.id,
                device.protocol(),
                protocol
            )));
        }

        let existing = self.inner.context(device.id);
        if let Some(ctx) = existing {
            return self.update_device(ctx, device).await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self.inner.factory.create(&device, events_tx.clone())?;
        let device_id = device.id;
        let name = device.name.clone();
        let ctx = {
            let mut devices = write_lock(&self.inner.devices);
            if let Some(ctx) = devices.get(&device_id) {
                // 并发新增：保留先到的上下文
                ctx.clone()
            } else {
                let ctx = Arc::new(DeviceContext::new(device, connection, events_tx));
                devices.insert(device_id, ctx.clone());
                let pump = tokio::spawn(event_pump(
                    Arc::downgrade(&self.inner),
                    Arc::downgrade(&ctx),
                    events_rx,
                ));
                ctx.set_pump(pump);
                info!(
                    target: "ems.protocol",
                    protocol = %protocol,
                    device_id,
                    device = %name,
                    "device_added"
                );
                return Ok(());
            }
        };
        debug!(target: "ems.protocol", device_id = ctx.device_id, "device_add_raced");
        Ok(())
    }

    async fn update_device(
        &self,
        ctx: Arc<DeviceContext<C>>,
        device: Device,
    ) -> Result<(), ProtocolError> {
        let previous = ctx.device();
        let mut device = device;
        device.connection_state = previous.connection_state;
        if previous == device {
            return Ok(());
        }
        let endpoint_changed = previous.endpoint != device.endpoint;
        let is_active = device.is_active;
        ctx.set_device(device.clone());

        if endpoint_changed {
            self.inner.disconnect_context(&ctx).await;
            let connection = self.inner.factory.create(&device, ctx.events_tx.clone())?;
            *ctx.connection.lock().await = connection;
            info!(
                target: "ems.protocol",
                device_id = ctx.device_id,
                "device_endpoint_changed"
            );
        } else if !is_active {
            self.inner.disconnect_context(&ctx).await;
        }
        debug!(target: "ems.protocol", device_id = ctx.device_id, "device_updated");
        Ok(())
    }

    /// 移除设备（先断开）
    pub async fn remove_device(&self, device_id: DeviceId) -> bool {
        let removed = write_lock(&self.inner.devices).remove(&device_id);
        let Some(ctx) = removed else {
            return false;
        };
        self.inner.disconnect_context(&ctx).await;
        ctx.abort_tasks();
        info!(target: "ems.protocol", device_id, "device_removed");
        true
    }

    /// 原子替换设备变量集合并重算轮询组；已连接的订阅型设备立即重新订阅
    pub async fn update_variables(
        &self,
        device_id: DeviceId,
        variables: Vec<Variable>,
    ) -> Result<(), ProtocolError> {
        let ctx = self
            .inner
            .context(device_id)
            .ok_or(ProtocolError::DeviceNotFound(device_id))?;
        let variables: Vec<Variable> = variables
            .into_iter()
            .filter(|v| v.device_id == device_id)
            .collect();
        let count = variables.len();
        let next = VariableSet::new(variables);
        let intervals = next.groups().intervals();
        let previous = ctx.replace_variables(next);
        ctx.retain_last_polled(&intervals);

        if ctx.is_connected() && self.inner.strategy.mode() == AcquisitionMode::Subscribed {
            let current: Vec<String> = ctx
                .variables()
                .active_addresses()
                .into_iter()
                .map(|(address, _)| address)
                .collect();
            let removed: Vec<String> = previous
                .active_addresses()
                .into_iter()
                .map(|(address, _)| address)
                .filter(|address| !current.contains(address))
                .collect();
            self.inner.apply_subscriptions(&ctx, &removed).await;
        }
        debug!(
            target: "ems.protocol",
            device_id,
            variables = count,
            groups = intervals.len(),
            "device_variables_updated"
        );
        Ok(())
    }

    pub fn is_connected(&self, device_id: DeviceId) -> bool {
        self.inner
            .context(device_id)
            .map(|ctx| ctx.is_connected())
            .unwrap_or(false)
    }

    pub fn context(&self, device_id: DeviceId) -> Option<Arc<DeviceContext<C>>> {
        self.inner.context(device_id)
    }

    pub fn contexts(&self) -> Vec<Arc<DeviceContext<C>>> {
        read_lock(&self.inner.devices).values().cloned().collect()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = read_lock(&self.inner.devices).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 连接设备；失败只记录日志并安排退避重连
    pub async fn connect(&self, device_id: DeviceId) -> bool {
        self.inner.connect_device(device_id).await
    }

    /// 断开设备（幂等）
    pub async fn disconnect(&self, device_id: DeviceId) -> bool {
        match self.inner.context(device_id) {
            Some(ctx) => self.inner.disconnect_context(&ctx).await,
            None => false,
        }
    }

    /// 并行连接多个设备，返回连接成功数
    pub async fn connect_many(&self, device_ids: &[DeviceId]) -> usize {
        join_all(device_ids.iter().map(|id| self.inner.connect_device(*id)))
            .await
            .into_iter()
            .filter(|connected| *connected)
            .count()
    }

    pub async fn disconnect_many(&self, device_ids: &[DeviceId]) {
        join_all(device_ids.iter().map(|id| self.disconnect(*id))).await;
    }

    /// 连接全部激活且未连接的设备
    pub async fn connect_active(&self) -> usize {
        let pending: Vec<DeviceId> = self
            .contexts()
            .into_iter()
            .filter(|ctx| ctx.is_active() && !ctx.is_connected())
            .map(|ctx| ctx.device_id)
            .collect();
        self.connect_many(&pending).await
    }

    /// 写入单个地址
    pub async fn write(
        &self,
        device_id: DeviceId,
        address: &str,
        value: &VariableValue,
    ) -> Result<(), ProtocolError> {
        let ctx = self
            .inner
            .context(device_id)
            .ok_or(ProtocolError::DeviceNotFound(device_id))?;
        if !ctx.is_connected() {
            return Err(ProtocolError::NotConnected(device_id));
        }
        let result = {
            let mut connection = ctx.connection.lock().await;
            let write = connection.write(address, value);
            match timeout(self.inner.config.request_timeout, write).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout(format!("write {}", address))),
            }
        };
        if let Err(err) = &result {
            warn!(
                target: "ems.protocol",
                device_id,
                address,
                error = %err,
                "device_write_failed"
            );
            if err.is_connection_loss() {
                self.inner.handle_connection_lost(&ctx, &err.to_string()).await;
            }
        }
        result
    }

    /// 通过设备连接发布外发消息
    pub async fn publish(
        &self,
        device_id: DeviceId,
        messages: &[PendingOutboundMessage],
    ) -> Result<usize, ProtocolError> {
        let ctx = self
            .inner
            .context(device_id)
            .ok_or(ProtocolError::DeviceNotFound(device_id))?;
        if !ctx.is_connected() {
            return Err(ProtocolError::NotConnected(device_id));
        }
        let result = {
            let mut connection = ctx.connection.lock().await;
            match timeout(self.inner.config.request_timeout, connection.publish(messages)).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout("publish".to_string())),
            }
        };
        if let Err(err) = &result {
            if err.is_connection_loss() {
                self.inner.handle_connection_lost(&ctx, &err.to_string()).await;
            }
        }
        result
    }

    /// 轮询单个设备的到期轮询组。同一设备的各组顺序执行。
    pub async fn poll_device(&self, ctx: &Arc<DeviceContext<C>>, now: Instant) -> DevicePollReport {
        self.inner.poll_device(ctx, now).await
    }

    /// 停止重连并在限定时间内并行断开全部设备；返回是否在时限内完成
    pub async fn dispose(&self, wait: Duration) -> bool {
        self.inner.closed.store(true, Ordering::SeqCst);
        let contexts = self.contexts();
        for ctx in &contexts {
            ctx.cancel_reconnect();
        }
        let disconnects = join_all(
            contexts
                .iter()
                .map(|ctx| self.inner.disconnect_context(ctx)),
        );
        let completed = timeout(wait, disconnects).await.is_ok();
        for ctx in &contexts {
            ctx.abort_tasks();
        }
        if completed {
            info!(
                target: "ems.protocol",
                protocol = %self.inner.strategy.protocol(),
                devices = contexts.len(),
                "manager_disposed"
            );
        } else {
            warn!(
                target: "ems.protocol",
                protocol = %self.inner.strategy.protocol(),
                wait_ms = wait.as_millis() as u64,
                "manager_dispose_timed_out"
            );
        }
        completed
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

enum ConnectAttempt {
    Connected,
    AlreadyConnected,
    Failed(ProtocolError),
}

impl<C: DeviceConnection> ManagerInner<C> {
    fn context(&self, device_id: DeviceId) -> Option<Arc<DeviceContext<C>>> {
        read_lock(&self.devices).get(&device_id).cloned()
    }

    async fn connect_device(&self, device_id: DeviceId) -> bool {
        let Some(ctx) = self.context(device_id) else {
            warn!(target: "ems.protocol", device_id, "connect_unknown_device");
            return false;
        };
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if !ctx.is_active() {
            debug!(target: "ems.protocol", device_id, "device_inactive_skip_connect");
            return false;
        }
        if ctx.is_connected() {
            return true;
        }

        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        if self.context(device_id).is_none() || self.closed.load(Ordering::SeqCst) {
            return false;
        }

        let attempt = {
            let mut connection = ctx.connection.lock().await;
            if ctx.is_connected() {
                ConnectAttempt::AlreadyConnected
            } else {
                ems_telemetry::record_connect_attempts();
                self.set_state(&ctx, ConnectionState::Connecting).await;
                match timeout(self.config.connect_timeout, connection.connect()).await {
                    Ok(Ok(())) => {
                        ctx.connected.store(true, Ordering::SeqCst);
                        ConnectAttempt::Connected
                    }
                    Ok(Err(err)) => ConnectAttempt::Failed(err),
                    Err(_) => {
                        let _ = connection.disconnect().await;
                        ConnectAttempt::Failed(ProtocolError::Timeout(format!(
                            "connect after {}ms",
                            self.config.connect_timeout.as_millis()
                        )))
                    }
                }
            }
        };
        drop(permit);

        match attempt {
            ConnectAttempt::AlreadyConnected => true,
            ConnectAttempt::Connected => {
                ctx.reconnect.reset();
                ctx.clear_last_polled();
                ems_telemetry::record_connect_success();
                info!(
                    target: "ems.protocol",
                    protocol = %self.strategy.protocol(),
                    device_id,
                    "device_connected"
                );
                self.set_state(&ctx, ConnectionState::Connected).await;
                if self.strategy.mode() == AcquisitionMode::Subscribed {
                    self.apply_subscriptions(&ctx, &[]).await;
                }
                true
            }
            ConnectAttempt::Failed(err) => {
                ems_telemetry::record_connect_failure();
                warn!(
                    target: "ems.protocol",
                    protocol = %self.strategy.protocol(),
                    device_id,
                    attempts = ctx.reconnect.attempts(),
                    error = %err,
                    "device_connect_failed"
                );
                self.set_state(&ctx, ConnectionState::Failed).await;
                self.schedule_reconnect(&ctx);
                false
            }
        }
    }

    async fn disconnect_context(&self, ctx: &Arc<DeviceContext<C>>) -> bool {
        ctx.cancel_reconnect();
        let was_connected = {
            let mut connection = ctx.connection.lock().await;
            if let Err(err) = connection.disconnect().await {
                debug!(
                    target: "ems.protocol",
                    device_id = ctx.device_id,
                    error = %err,
                    "device_disconnect_error"
                );
            }
            ctx.connected.swap(false, Ordering::SeqCst)
        };
        self.set_state(ctx, ConnectionState::Disconnected).await;
        if was_connected {
            info!(target: "ems.protocol", device_id = ctx.device_id, "device_disconnected");
        }
        was_connected
    }

    async fn handle_connection_lost(&self, ctx: &Arc<DeviceContext<C>>, reason: &str) {
        if !ctx.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(
            target: "ems.protocol",
            protocol = %self.strategy.protocol(),
            device_id = ctx.device_id,
            reason,
            "device_connection_lost"
        );
        {
            let mut connection = ctx.connection.lock().await;
            let _ = connection.disconnect().await;
        }
        self.set_state(ctx, ConnectionState::Disconnected).await;
        self.schedule_reconnect(ctx);
    }

    fn schedule_reconnect(&self, ctx: &Arc<DeviceContext<C>>) {
        if self.closed.load(Ordering::SeqCst) || !ctx.is_active() {
            return;
        }
        if ctx.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let attempt = ctx.reconnect.record_failure();
        let delay = self.config.reconnect.delay_for(attempt);
        ems_telemetry::record_reconnect_scheduled();
        debug!(
            target: "ems.protocol",
            device_id = ctx.device_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect_scheduled"
        );
        if self.reconnect_tx.send((ctx.device_id, delay)).is_err() {
            ctx.reconnect_pending.store(false, Ordering::SeqCst);
        }
    }

    async fn retry_connect(&self, device_id: DeviceId) {
        let Some(ctx) = self.context(device_id) else {
            return;
        };
        ctx.reconnect_pending.store(false, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || !ctx.is_active() || ctx.is_connected() {
            return;
        }
        self.connect_device(device_id).await;
    }

    async fn apply_subscriptions(&self, ctx: &Arc<DeviceContext<C>>, removed: &[String]) {
        let requests: Vec<_> = ctx
            .variables()
            .active_addresses()
            .into_iter()
            .map(|(address, interval)| self.strategy.subscribe_request(&address, interval))
            .collect();
        let mut connection = ctx.connection.lock().await;
        if !removed.is_empty() {
            let result = timeout(self.config.request_timeout, connection.unsubscribe(removed)).await;
            if !matches!(result, Ok(Ok(()))) {
                warn!(
                    target: "ems.protocol",
                    device_id = ctx.device_id,
                    count = removed.len(),
                    "unsubscribe_failed"
                );
            }
        }
        if requests.is_empty() {
            return;
        }
        match timeout(self.config.connect_timeout, connection.subscribe(&requests)).await {
            Ok(Ok(())) => {
                debug!(
                    target: "ems.protocol",
                    device_id = ctx.device_id,
                    count = requests.len(),
                    "subscriptions_applied"
                );
            }
            Ok(Err(err)) => {
                warn!(
                    target: "ems.protocol",
                    device_id = ctx.device_id,
                    error = %err,
                    "subscription_setup_failed"
                );
            }
            Err(_) => {
                warn!(
                    target: "ems.protocol",
                    device_id = ctx.device_id,
                    "subscription_setup_timed_out"
                );
            }
        }
    }

    fn dispatch_value(
        &self,
        ctx: &DeviceContext<C>,
        address: &str,
        value: VariableValue,
        ts_ms: i64,
    ) -> usize {
        let variables = ctx.variables();
        let ids = variables.ids_for_address(address);
        if ids.is_empty() {
            debug!(
                target: "ems.protocol",
                device_id = ctx.device_id,
                address,
                "value_for_unknown_address"
            );
            return 0;
        }
        for id in ids {
            self.hooks
                .values
                .enqueue_value(*id, ctx.device_id, value.clone(), ts_ms);
        }
        ids.len()
    }

    async fn poll_device(&self, ctx: &Arc<DeviceContext<C>>, now: Instant) -> DevicePollReport {
        let mut report = DevicePollReport::default();
        if !ctx.is_connected() {
            return report;
        }
        let due = ctx.due_groups(now);
        if due.is_empty() {
            return report;
        }
        let variables = ctx.variables();
        let max_batch = self.strategy.max_read_batch().max(1);
        let mut lost: Option<String> = None;
        {
            let mut connection = ctx.connection.lock().await;
            for (interval, ids) in due {
                let addresses = variables.addresses_of(&ids);
                let mut group_ok = true;
                for chunk in addresses.chunks(max_batch) {
                    report.reads += 1;
                    ems_telemetry::record_poll_reads();
                    let result =
                        match timeout(self.config.request_timeout, connection.read(chunk)).await {
                            Ok(result) => result,
                            Err(_) => Err(ProtocolError::Timeout(format!(
                                "read {} items",
                                chunk.len()
                            ))),
                        };
                    match result {
                        Ok(outcomes) => {
                            let ts_ms = domain::now_epoch_ms();
                            for outcome in outcomes {
                                match outcome.result {
                                    Ok(value) => {
                                        report.values +=
                                            self.dispatch_value(ctx, &outcome.address, value, ts_ms);
                                    }
                                    Err(reason) => {
                                        debug!(
                                            target: "ems.protocol",
                                            device_id = ctx.device_id,
                                            address = %outcome.address,
                                            reason = %reason,
                                            "poll_item_failed"
                                        );
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            group_ok = false;
                            report.failed_reads += 1;
                            ems_telemetry::record_poll_read_failures();
                            warn!(
                                target: "ems.protocol",
                                device_id = ctx.device_id,
                                interval_ms = interval.as_millis(),
                                error = %err,
                                "poll_group_read_failed"
                            );
                            if err.is_connection_loss() {
                                lost = Some(err.to_string());
                            }
                            break;
                        }
                    }
                }
                if group_ok {
                    report.groups_polled += 1;
                    ctx.mark_polled(interval, now);
                }
                if lost.is_some() {
                    break;
                }
            }
        }
        if let Some(reason) = lost {
            self.handle_connection_lost(ctx, &reason).await;
        }
        report
    }

    async fn set_state(&self, ctx: &DeviceContext<C>, state: ConnectionState) {
        if ctx.swap_state(state) == state {
            return;
        }
        let protocol = self.strategy.protocol();
        if let Some(events) = &self.hooks.events {
            let event = EngineEvent::ConnectionStateChanged {
                device_id: ctx.device_id,
                protocol,
                state,
                connected: state.is_connected(),
            };
            match events.try_send(event) {
                Ok(()) | Err(BusError::Closed(_)) => {}
                Err(err) => {
                    debug!(
                        target: "ems.protocol",
                        device_id = ctx.device_id,
                        error = %err,
                        "engine_event_dropped"
                    );
                }
            }
        }
        if let Some(catalog) = &self.hooks.catalog {
            if let Err(err) = catalog.set_connection_state(ctx.device_id, state).await {
                warn!(
                    target: "ems.protocol",
                    device_id = ctx.device_id,
                    error = %err,
                    "connection_state_projection_failed"
                );
            }
        }
    }
}

/// 重连调度：按请求延迟后重新连接（独立任务，避免连接流程自我递归）
async fn reconnect_loop<C: DeviceConnection>(
    inner: Weak<ManagerInner<C>>,
    mut requests: mpsc::UnboundedReceiver<(DeviceId, Duration)>,
) {
    while let Some((device_id, delay)) = requests.recv().await {
        let Some(manager) = inner.upgrade() else {
            break;
        };
        let Some(ctx) = manager.context(device_id) else {
            continue;
        };
        let weak = inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = weak.upgrade() {
                manager.retry_connect(device_id).await;
            }
        });
        ctx.set_reconnect_task(handle);
    }
}

/// 连接事件泵：数据变化入流水线，断线转入重连
async fn event_pump<C: DeviceConnection>(
    inner: Weak<ManagerInner<C>>,
    ctx: Weak<DeviceContext<C>>,
    mut events: ConnectionEventReceiver,
) {
    while let Some(event) = events.recv().await {
        let (Some(manager), Some(ctx)) = (inner.upgrade(), ctx.upgrade()) else {
            break;
        };
        match event {
            ConnectionEvent::ValueChanged {
                address,
                value,
                ts_ms,
            } => {
                manager.dispatch_value(&ctx, &address, value, ts_ms);
            }
            ConnectionEvent::Disconnected { reason } => {
                manager.handle_connection_lost(&ctx, &reason).await;
            }
        }
    }
}
