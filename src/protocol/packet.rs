use bytes::Bytes;

/// Wire discriminant shared by both packet directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Login request/response exchange
    Login = 0x00,
    /// Command request/response exchange
    Command = 0x01,
    /// Server-initiated message and its client acknowledgement
    Message = 0x02,
}

impl PacketKind {
    /// Parses the packet type byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(PacketKind::Login),
            0x01 => Some(PacketKind::Command),
            0x02 => Some(PacketKind::Message),
            _ => None,
        }
    }

    /// Returns the wire byte for this packet type
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Packets sent from the client to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    /// Authenticates with the server; the payload is the raw password
    Login {
        /// Password bytes (must not contain NUL)
        password: Bytes,
    },

    /// Issues a command to the server
    Command {
        /// Sequence number correlating the response
        sequence: u8,
        /// UTF-8 command text
        command: Bytes,
    },

    /// Acknowledges a server message
    Message {
        /// Sequence number of the message being acknowledged
        sequence: u8,
    },
}

impl ClientPacket {
    /// Builds a login packet from password text
    pub fn login(password: &str) -> Self {
        ClientPacket::Login {
            password: Bytes::copy_from_slice(password.as_bytes()),
        }
    }

    /// Builds a command packet from command text
    pub fn command(sequence: u8, command: &str) -> Self {
        ClientPacket::Command {
            sequence,
            command: Bytes::copy_from_slice(command.as_bytes()),
        }
    }

    /// Builds a message acknowledgement packet
    pub fn ack(sequence: u8) -> Self {
        ClientPacket::Message { sequence }
    }

    /// Returns this packet's wire type
    pub fn kind(&self) -> PacketKind {
        match self {
            ClientPacket::Login { .. } => PacketKind::Login,
            ClientPacket::Command { .. } => PacketKind::Command,
            ClientPacket::Message { .. } => PacketKind::Message,
        }
    }

    /// Returns the command or message sequence number, if any
    pub fn sequence(&self) -> Option<u8> {
        match self {
            ClientPacket::Login { .. } => None,
            ClientPacket::Command { sequence, .. } => Some(*sequence),
            ClientPacket::Message { sequence } => Some(*sequence),
        }
    }
}

/// Packets sent from the server to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// Reports whether the login attempt was accepted
    Login {
        /// True when the password was accepted
        success: bool,
    },

    /// One frame of a command response
    ///
    /// Single-frame responses carry `total == 1` and `index == 0`;
    /// on the wire they omit the multipart envelope entirely.
    Command {
        /// Sequence number of the command being responded to
        sequence: u8,
        /// Number of frames in the full response, at least 1
        total: u8,
        /// Zero-based position of this frame, below `total`
        index: u8,
        /// This frame's slice of the response text
        payload: Bytes,
    },

    /// A server-initiated message requiring acknowledgement
    Message {
        /// Sequence number used for dedup and acknowledgement
        sequence: u8,
        /// UTF-8 message text
        message: Bytes,
    },
}

impl ServerPacket {
    /// Builds a single-frame command response
    pub fn command_response(sequence: u8, payload: &str) -> Self {
        ServerPacket::Command {
            sequence,
            total: 1,
            index: 0,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    /// Returns this packet's wire type
    pub fn kind(&self) -> PacketKind {
        match self {
            ServerPacket::Login { .. } => PacketKind::Login,
            ServerPacket::Command { .. } => PacketKind::Command,
            ServerPacket::Message { .. } => PacketKind::Message,
        }
    }

    /// Returns the command or message sequence number, if any
    pub fn sequence(&self) -> Option<u8> {
        match self {
            ServerPacket::Login { .. } => None,
            ServerPacket::Command { sequence, .. } => Some(*sequence),
            ServerPacket::Message { sequence, .. } => Some(*sequence),
        }
    }
}
