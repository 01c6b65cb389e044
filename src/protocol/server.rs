use std::collections::HashSet;

use bytes::Bytes;

use crate::core::{Error, Result};
use super::check::NonceCheck;
use super::codec;
use super::packet::{ClientPacket, ServerPacket};
use super::state::DEFAULT_NONCE_WINDOW;

/// Default size of one command-response chunk in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Events produced by the server state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client attempted to authenticate
    AuthAttempt {
        /// Whether the password matched
        success: bool,
    },
    /// The client issued a command
    Command {
        /// Sequence to respond under
        sequence: u8,
        /// The command text
        command: String,
    },
    /// The client acknowledged a server message
    MessageAck {
        /// Sequence of the acknowledged message
        sequence: u8,
    },
}

/// Represents the current authentication state of the server protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// The client has not authenticated yet
    NoAuth,
    /// The client presented the correct password
    Authenticated,
    /// Terminal state; no further input is legal
    Closed,
}

/// Sans-I/O implementation of the server side of the RCON protocol,
/// handling a single client
///
/// This is the mirror image of [`RconClientProtocol`]: it consumes client
/// datagrams and produces server packets and events. It exists primarily
/// as a deterministic test double for the client, but a server driver can
/// be built on it the same way the connector is built on the client
/// machine.
///
/// [`RconClientProtocol`]: super::state::RconClientProtocol
#[derive(Debug)]
pub struct RconServerProtocol {
    state: ServerState,
    password: String,
    response_chunk_size: usize,
    next_sequence: u8,
    pending_acks: HashSet<u8>,
    command_check: NonceCheck,
    events: Vec<ServerEvent>,
    to_send: Vec<ServerPacket>,
}

impl RconServerProtocol {
    /// Creates a server protocol expecting the given password
    pub fn new(password: &str) -> Self {
        Self::with_chunk_size(password, DEFAULT_CHUNK_SIZE)
    }

    /// Creates a server protocol with a custom response chunk size
    pub fn with_chunk_size(password: &str, response_chunk_size: usize) -> Self {
        RconServerProtocol {
            state: ServerState::NoAuth,
            password: password.to_owned(),
            response_chunk_size: response_chunk_size.max(1),
            next_sequence: 0,
            pending_acks: HashSet::new(),
            command_check: NonceCheck::new(DEFAULT_NONCE_WINDOW)
                .expect("default nonce window is valid"),
            events: Vec::new(),
            to_send: Vec::new(),
        }
    }

    /// Returns the current state
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Feeds one datagram from the client into the machine
    pub fn receive_datagram(&mut self, data: &[u8]) -> Result<ClientPacket> {
        let packet = codec::decode_client(data)?;

        match &packet {
            ClientPacket::Login { password } => {
                self.assert_state(ServerState::NoAuth, "a login request")?;

                let success = password.as_ref() == self.password.as_bytes();
                if success {
                    self.state = ServerState::Authenticated;
                }
                self.to_send.push(ServerPacket::Login { success });
                self.events.push(ServerEvent::AuthAttempt { success });
            }

            ClientPacket::Command { sequence, command } => {
                self.assert_state(ServerState::Authenticated, "a command")?;
                let text = String::from_utf8(command.to_vec())
                    .map_err(|_| Error::malformed("command is not valid UTF-8"))?;

                // Retransmissions of an in-flight command must not run the
                // command twice; the driver replays its cached response.
                if self.command_check.check(*sequence) {
                    self.events.push(ServerEvent::Command {
                        sequence: *sequence,
                        command: text,
                    });
                }
            }

            ClientPacket::Message { sequence } => {
                self.assert_state(ServerState::Authenticated, "a message acknowledgement")?;
                if !self.pending_acks.remove(sequence) {
                    return Err(Error::protocol(format!(
                        "unexpected message acknowledgement (sequence {sequence})"
                    )));
                }
                self.events.push(ServerEvent::MessageAck { sequence: *sequence });
            }
        }

        Ok(packet)
    }

    /// Emits the response frames for a previously received command
    ///
    /// Responses longer than the chunk size are split into a multipart
    /// envelope; a response needing more than 255 frames is refused.
    pub fn respond_to_command(&mut self, sequence: u8, response: &str) -> Result<Vec<ServerPacket>> {
        self.assert_state(ServerState::Authenticated, "responding to a command")?;

        let bytes = response.as_bytes();
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![b""]
        } else {
            bytes.chunks(self.response_chunk_size).collect()
        };

        if chunks.len() > 255 {
            return Err(Error::protocol(format!(
                "response requires {} frames but the envelope caps at 255",
                chunks.len()
            )));
        }

        let total = chunks.len() as u8;
        let packets: Vec<ServerPacket> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, part)| ServerPacket::Command {
                sequence,
                total,
                index: index as u8,
                payload: Bytes::copy_from_slice(part),
            })
            .collect();

        self.to_send.extend(packets.iter().cloned());
        Ok(packets)
    }

    /// Emits a server message under a freshly allocated sequence
    ///
    /// The message stays in the unacknowledged set until the client acks
    /// it; drivers retransmit the returned packet until then.
    pub fn send_message(&mut self, message: &str) -> Result<ServerPacket> {
        self.assert_state(ServerState::Authenticated, "sending a message")?;

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pending_acks.insert(sequence);

        let packet = ServerPacket::Message {
            sequence,
            message: Bytes::copy_from_slice(message.as_bytes()),
        };
        self.to_send.push(packet.clone());
        Ok(packet)
    }

    /// Drains the queue of packets waiting to be written
    pub fn packets_to_send(&mut self) -> Vec<ServerPacket> {
        std::mem::take(&mut self.to_send)
    }

    /// Drains the queue of events waiting to be dispatched
    pub fn events_received(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Returns the number of messages still awaiting acknowledgement
    pub fn unacknowledged_messages(&self) -> usize {
        self.pending_acks.len()
    }

    /// Resets the protocol to its beginning state
    pub fn reset(&mut self) {
        self.state = ServerState::NoAuth;
        self.next_sequence = 0;
        self.pending_acks.clear();
        self.command_check.reset();
        self.events.clear();
        self.to_send.clear();
    }

    /// Moves the protocol into its terminal state
    pub fn close(&mut self) {
        self.state = ServerState::Closed;
    }

    fn assert_state(&self, expected: ServerState, what: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::invalid_state(format!(
                "{what} is not legal in the {:?} state",
                self.state
            )));
        }
        Ok(())
    }
}
