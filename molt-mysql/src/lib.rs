//! Low-level MySQL plumbing shared by the molt migration engine.
//!
//! This crate knows nothing about migrations. It provides connection
//! configuration, binlog coordinates, instance keys, server identity
//! snapshots and version parsing on top of sqlx's MySQL driver.

pub mod connection;
pub mod coordinates;
pub mod instance_key;
pub mod lag;
pub mod server_info;
pub mod version;

pub use connection::MySqlConnectionConfig;
pub use coordinates::BinlogCoordinates;
pub use instance_key::{InstanceKey, InstanceKeyMap};
pub use server_info::{ServerInfo, ServerPort};
