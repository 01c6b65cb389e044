//! bercon: an asynchronous client library for the BattlEye RCON protocol
//!
//! BattlEye RCON is a UDP-based, password-authenticated remote
//! administration channel used by Arma and DayZ servers. This crate
//! implements the protocol as a sans-I/O state machine
//! ([`protocol::RconClientProtocol`]) driven by a tokio connector
//! ([`RconClient`] / [`Session`]) that handles keep-alives, command
//! retransmission, and reconnection with exponential backoff.
//!
//! ```no_run
//! use bercon::{RconClient, Event};
//!
//! # async fn example() -> bercon::Result<()> {
//! let client = RconClient::new();
//! let session = client.connect("127.0.0.1", 2302, "password").await?;
//!
//! let mut events = session.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         if let Event::ServerMessage { message, .. } = event {
//!             println!("{message}");
//!         }
//!     }
//! });
//!
//! let players = session.send_command("players").await?;
//! println!("{players}");
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod network;
pub mod protocol;
mod util;

// Re-export commonly used items
pub use self::core::{ConnectorConfig, Encoding, Error, ReconnectConfig, Result};
pub use self::network::{DisconnectReason, Event, LoginFailureKind, RconClient, Session};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
