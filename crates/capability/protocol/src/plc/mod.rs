//! PLC（S7 over ISO-on-TCP）

pub mod address;
pub mod client;
pub mod codec;
pub mod connection;

pub use address::{PlcAddress, PlcArea, PlcDataType, parse_address};
pub use client::S7Client;
pub use connection::{PlcConnection, PlcConnectionFactory};
