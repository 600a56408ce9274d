//! MQTT：Broker 连接、入站载荷、外发发布循环

pub mod connection;
pub mod payload;
pub mod publisher;

pub use connection::{MqttConnection, MqttConnectionFactory};
pub use payload::{InboundValue, parse_inbound};
pub use publisher::{OutboundPublisher, OutboundSink, PublishReport, PublisherConfig};
