//! Core types and constants for the RCON client
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod config;
pub mod error;
pub mod serde;

pub use self::config::{ConnectorConfig, Encoding, ReconnectConfig};
pub use self::error::{Error, Result};

/// Default BattlEye RCON port used by Arma servers
pub const DEFAULT_PORT: u16 = 2302;

/// Maximum serialized packet size in bytes (maximum UDP payload)
pub const MAX_PACKET_SIZE: usize = 65507;

/// Seconds of server silence after which the connection is considered dead
///
/// Fixed by the published protocol; the server drops idle clients on the
/// same schedule.
pub const LAST_RECEIVED_TIMEOUT: u64 = 45;
