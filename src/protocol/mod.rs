//! Sans-I/O protocol implementation
//!
//! This module defines the wire format, packet types, and the protocol
//! state machines for both directions of the RCON protocol. Nothing in
//! here performs I/O or timing; the [`crate::network`] connector drives
//! these types against a real socket.

pub mod check;
pub mod codec;
pub mod packet;
pub mod server;
pub mod state;

pub use self::check::NonceCheck;
pub use self::codec::PacketCodec;
pub use self::packet::{ClientPacket, PacketKind, ServerPacket};
pub use self::server::{RconServerProtocol, ServerEvent, ServerState};
pub use self::state::{ClientState, ProtocolEvent, RconClientProtocol};
