use std::io;
use thiserror::Error;

/// Custom error types for the RCON client
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("CRC32 checksum does not match the packet data")]
    ChecksumMismatch,

    #[error("max packet size exceeded by {0} bytes")]
    PacketTooLarge(usize),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("the server refused the provided password")]
    LoginRefused,

    #[error("the server did not respond to the login request")]
    LoginTimeout,

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("not connected to the server")]
    NotConnected,

    #[error("all 256 command sequences are in flight")]
    NoAvailableSequence,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new malformed packet error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedPacket(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new command error
    pub fn command(msg: impl Into<String>) -> Self {
        Error::CommandFailed(msg.into())
    }

    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns true when the error should tear the session down and
    /// trigger a reconnect. False means another attempt cannot help,
    /// such as a refused password or an unencodable one, and the
    /// reconnect supervisor gives up instead.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::LoginTimeout | Error::NotConnected)
    }
}
