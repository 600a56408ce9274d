//! ChannelBus：按名称注册的有界通道表
//!
//! 组件之间不持有彼此引用，只按名称取同一条通道。关闭通道后写端立即失效，
//! 读端把剩余消息读完后返回 `None`。

use crate::error::BusError;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// 引擎事件通道名
pub const ENGINE_EVENTS_CHANNEL: &str = "engine.events";

type ErasedChannel = Arc<dyn Any + Send + Sync>;

/// 命名通道注册表
#[derive(Default)]
pub struct ChannelBus {
    channels: Mutex<HashMap<String, (ErasedChannel, Arc<dyn Closeable>)>>,
}

trait Closeable: Send + Sync {
    fn close(&self);
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建通道。已存在时忽略 `capacity`，类型不一致返回 `TypeMismatch`。
    pub fn channel<T: Send + 'static>(
        &self,
        name: &str,
        capacity: usize,
    ) -> Result<Arc<BusChannel<T>>, BusError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| BusError::Closed(name.to_string()))?;
        if let Some((erased, _)) = channels.get(name) {
            return Arc::clone(erased)
                .downcast::<BusChannel<T>>()
                .map_err(|_| BusError::TypeMismatch(name.to_string()));
        }
        let channel = Arc::new(BusChannel::new(name, capacity.max(1)));
        channels.insert(
            name.to_string(),
            (channel.clone() as ErasedChannel, channel.clone() as Arc<dyn Closeable>),
        );
        Ok(channel)
    }

    /// 关闭指定通道（不存在时忽略）
    pub fn close(&self, name: &str) {
        if let Ok(channels) = self.channels.lock() {
            if let Some((_, closeable)) = channels.get(name) {
                closeable.close();
            }
        }
    }

    /// 关闭全部通道
    pub fn close_all(&self) {
        if let Ok(channels) = self.channels.lock() {
            for (_, closeable) in channels.values() {
                closeable.close();
            }
        }
    }
}

/// 有界 FIFO 通道（多写一读）
#[derive(Debug)]
pub struct BusChannel<T> {
    name: String,
    tx: mpsc::Sender<T>,
    rx: tokio::sync::Mutex<mpsc::Receiver<T>>,
    closed: watch::Sender<bool>,
}

impl<T: Send + 'static> BusChannel<T> {
    fn new(name: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (closed, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 非阻塞写入；满时返回 `Full`。
    pub fn try_send(&self, item: T) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed(self.name.clone()));
        }
        self.tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => BusError::Full(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => BusError::Closed(self.name.clone()),
        })
    }

    /// 等待容量后写入；通道关闭时返回 `Closed`。
    pub async fn send(&self, item: T) -> Result<(), BusError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(BusError::Closed(self.name.clone()));
        }
        tokio::select! {
            result = self.tx.send(item) => {
                result.map_err(|_| BusError::Closed(self.name.clone()))
            }
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                Err(BusError::Closed(self.name.clone()))
            }
        }
    }

    /// 读取下一条消息；通道关闭且读空后返回 `None`。
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            rx.close();
            return rx.recv().await;
        }
        tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                rx.close();
                rx.recv().await
            }
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl<T: Send + 'static> Closeable for BusChannel<T> {
    fn close(&self) {
        BusChannel::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_name_returns_same_channel() {
        let bus = ChannelBus::new();
        let first = bus.channel::<u32>("numbers", 4).expect("create");
        let second = bus.channel::<u32>("numbers", 99).expect("get");
        first.try_send(7).expect("send");
        assert_eq!(second.recv().await, Some(7));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let bus = ChannelBus::new();
        bus.channel::<u32>("numbers", 4).expect("create");
        let err = bus.channel::<String>("numbers", 4).expect_err("mismatch");
        assert_eq!(err, BusError::TypeMismatch("numbers".to_string()));
    }

    #[test]
    fn full_channel_rejects_try_send() {
        let bus = ChannelBus::new();
        let channel = bus.channel::<u32>("small", 1).expect("create");
        channel.try_send(1).expect("first");
        assert_eq!(
            channel.try_send(2),
            Err(BusError::Full("small".to_string()))
        );
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let bus = ChannelBus::new();
        let channel = bus.channel::<u32>("drain", 8).expect("create");
        channel.try_send(1).expect("send");
        channel.try_send(2).expect("send");
        bus.close("drain");

        assert!(channel.try_send(3).is_err());
        assert_eq!(channel.recv().await, Some(1));
        assert_eq!(channel.recv().await, Some(2));
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn close_wakes_pending_reader() {
        let bus = Arc::new(ChannelBus::new());
        let channel = bus.channel::<u32>("idle", 8).expect("create");
        let reader = tokio::spawn({
            let channel = channel.clone();
            async move { channel.recv().await }
        });
        tokio::task::yield_now().await;
        bus.close_all();
        assert_eq!(reader.await.expect("join"), None);
    }
}
