//! Network connector module
//!
//! This module drives the sans-I/O protocol machines against a real UDP
//! socket: it owns the login handshake, command retransmission,
//! keep-alive probing, the silence watchdog, and reconnection.

mod commander;
mod connection;
mod event;

pub use self::event::{DisconnectReason, Event, LoginFailureKind};

use std::net::SocketAddr;

use tokio::net::lookup_host;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{ConnectorConfig, Error, Result};
use self::connection::Connection;

/// Entry point for opening RCON sessions
#[derive(Debug, Clone, Default)]
pub struct RconClient {
    config: ConnectorConfig,
}

impl RconClient {
    /// Creates a client with the default configuration
    pub fn new() -> Self {
        RconClient {
            config: ConnectorConfig::default(),
        }
    }

    /// Creates a client with a caller-provided configuration
    pub fn with_config(config: ConnectorConfig) -> Self {
        RconClient { config }
    }

    /// Returns the configuration this client connects with
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Connects to a server and authenticates
    ///
    /// Resolution failures, a refused password, and a login that exceeds
    /// the configured `connection_timeout` all surface here; once this
    /// returns a [`Session`], later disconnections are handled by the
    /// reconnect supervisor instead.
    pub async fn connect(&self, host: &str, port: u16, password: &str) -> Result<Session> {
        self.config.validate()?;
        self.config.encoding.validate(password)?;

        let peer = resolve(host, port).await?;
        debug!(%peer, "opening session");

        let connection = Connection::new(self.config.clone(), peer, password)?;
        // Subscribed before the supervisor starts so the first receiver
        // handed out observes the session's whole event history.
        let first_events = connection.subscribe();
        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = tokio::spawn(connection.clone().run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Session {
                connection,
                supervisor: Some(supervisor),
                first_events: std::sync::Mutex::new(Some(first_events)),
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::NotConnected),
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::config(format!("hostname {host:?} did not resolve to any address")))
}

/// Handle over one authenticated RCON session
///
/// The session closes when [`close`] is called or when the handle is
/// dropped; either way the background tasks wind down, outstanding
/// commands fail with [`Error::NotConnected`], and the socket is
/// released.
///
/// [`close`]: Session::close
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

pub struct Session {
    connection: Connection,
    supervisor: Option<JoinHandle<()>>,
    first_events: std::sync::Mutex<Option<broadcast::Receiver<Event>>>,
}

impl Session {
    /// Sends a command and waits for the server's assembled response
    pub async fn send_command(&self, command: &str) -> Result<String> {
        self.connection.send_command(command).await
    }

    /// Sends a command without waiting for a response
    ///
    /// Returns as soon as the packet is written. If the server does
    /// respond, the response still reaches event subscribers.
    pub async fn send(&self, command: &str) -> Result<()> {
        self.connection.fire_and_forget(command).await
    }

    /// Returns a receiver for the session's event stream
    ///
    /// The first receiver observes every event since the session began,
    /// including the initial [`Event::Login`]; later receivers only see
    /// events published after they were created.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        if let Some(receiver) = self.first_events.lock().unwrap().take() {
            return receiver;
        }
        self.connection.subscribe()
    }

    /// Returns true while the reconnect supervisor is alive
    pub fn is_running(&self) -> bool {
        self.connection.is_running()
    }

    /// Returns true while a socket to the server is open
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Returns true while the server considers us authenticated
    pub fn is_logged_in(&self) -> bool {
        self.connection.is_logged_in()
    }

    /// Closes the session; idempotent
    pub fn close(&self) {
        self.connection.close();
    }

    /// Waits for the background tasks to finish shutting down
    pub async fn wait_until_closed(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection.close();
    }
}
