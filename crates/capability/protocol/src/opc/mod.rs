//! OPC UA：会话抽象、订阅引擎、浏览与设备连接

pub mod browse;
pub mod connection;
pub mod session;
pub mod subscription;
#[cfg(feature = "opcua")]
pub mod ua;

pub use browse::{BrowsedNode, browse_tree};
pub use connection::{DEFAULT_BROWSE_DEPTH, OpcConnection, OpcConnectionFactory};
pub use session::{
    BrowseEntry, BrowsePage, DataChange, MonitoredItemSpec, NodeClass, OpcConnector, OpcLink,
    OpcSession, SessionStatus, UnavailableConnector,
};
pub use subscription::SubscriptionEngine;
#[cfg(feature = "opcua")]
pub use ua::{UaConnector, UaSession};

use std::sync::Arc;

/// 按编译特性选择默认连接器
pub fn default_connector() -> Arc<dyn OpcConnector> {
    #[cfg(feature = "opcua")]
    {
        Arc::new(UaConnector::default())
    }
    #[cfg(not(feature = "opcua"))]
    {
        Arc::new(UnavailableConnector)
    }
}
