use crate::protocol::ServerPacket;

/// Why a login attempt did not produce an authenticated session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureKind {
    /// The server rejected the password; retrying cannot help
    Refused,
    /// No login response arrived before the deadline
    Timeout,
}

/// Why an established session went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server was silent past the protocol's idle threshold
    Timeout,
    /// The underlying socket reported an error
    SocketError(String),
    /// The caller closed the session
    Closed,
}

/// Events published by the connector
///
/// Delivered in datagram-arrival order over a broadcast channel; a
/// subscriber that falls behind loses the oldest events first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A validly framed packet arrived, before any interpretation
    RawPacket(ServerPacket),
    /// The server accepted the password
    Login,
    /// A login attempt failed
    LoginFailure(LoginFailureKind),
    /// A command response was fully reassembled
    CommandResponse {
        /// Sequence of the command this responds to
        sequence: u8,
        /// The assembled response text
        message: String,
    },
    /// The server sent a (deduplicated) message
    ServerMessage {
        /// Sequence the message arrived with
        sequence: u8,
        /// The message text
        message: String,
    },
    /// The session lost its connection
    Disconnected(DisconnectReason),
}
