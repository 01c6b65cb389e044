use std::collections::HashMap;

use bytes::Bytes;

use crate::core::{Error, Result};
use super::check::NonceCheck;
use super::codec;
use super::packet::{ClientPacket, ServerPacket};

/// Default number of server-message sequences remembered for dedup
pub const DEFAULT_NONCE_WINDOW: usize = 5;

/// Events produced by the client state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The server accepted the password
    LoginSuccess,
    /// The server refused the password; the protocol is closed
    LoginRefused,
    /// A command response has been fully reassembled
    CommandResponse {
        /// Sequence of the command this responds to
        sequence: u8,
        /// The assembled response text
        message: String,
    },
    /// A server message passed the dedup check
    ServerMessage {
        /// Sequence the message arrived with
        sequence: u8,
        /// The message text
        message: String,
    },
}

/// Represents the current authentication state of the client protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No login attempt has been made yet
    NoAuth,
    /// A login packet has been sent, awaiting the server's verdict
    LoggingIn,
    /// Authenticated and able to exchange commands and messages
    LoggedIn,
    /// Terminal state; no further input is legal
    Closed,
}

/// Reassembly buffer for one outstanding command response
#[derive(Debug, Default)]
struct PendingResponse {
    /// Total frame count, fixed by the first fragment observed
    total: Option<u8>,
    /// Received fragments keyed by index
    fragments: HashMap<u8, Bytes>,
}

/// Sans-I/O implementation of the client side of the RCON protocol
///
/// The machine consumes raw datagrams via [`receive_datagram`] and caller
/// intents via [`send_login`] / [`send_command`], and produces outgoing
/// packets ([`packets_to_send`]) and events ([`events_received`]). It never
/// performs I/O, sleeps, or spawns tasks; all timing decisions belong to
/// the driver.
///
/// [`receive_datagram`]: RconClientProtocol::receive_datagram
/// [`send_login`]: RconClientProtocol::send_login
/// [`send_command`]: RconClientProtocol::send_command
/// [`packets_to_send`]: RconClientProtocol::packets_to_send
/// [`events_received`]: RconClientProtocol::events_received
#[derive(Debug)]
pub struct RconClientProtocol {
    state: ClientState,
    next_sequence: u8,
    pending: HashMap<u8, PendingResponse>,
    message_check: NonceCheck,
    events: Vec<ProtocolEvent>,
    to_send: Vec<ClientPacket>,
}

impl Default for RconClientProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl RconClientProtocol {
    /// Creates a protocol with the default dedup window
    pub fn new() -> Self {
        Self::with_nonce_window(DEFAULT_NONCE_WINDOW)
            .expect("default nonce window is valid")
    }

    /// Creates a protocol with a caller-chosen dedup window
    pub fn with_nonce_window(window: usize) -> Result<Self> {
        Ok(RconClientProtocol {
            state: ClientState::NoAuth,
            next_sequence: 0,
            pending: HashMap::new(),
            message_check: NonceCheck::new(window)?,
            events: Vec::new(),
            to_send: Vec::new(),
        })
    }

    /// Returns the current state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Returns true once the server has accepted the password
    pub fn is_logged_in(&self) -> bool {
        self.state == ClientState::LoggedIn
    }

    /// Returns the number of commands awaiting a response
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Emits a login packet and begins awaiting the server's verdict
    ///
    /// The returned packet is the exact payload queued for sending; the
    /// driver should reuse it when retrying a lost login rather than
    /// calling this method again.
    pub fn send_login(&mut self, password: &str) -> Result<ClientPacket> {
        self.assert_state(ClientState::NoAuth, "send_login")?;

        let packet = ClientPacket::login(password);
        self.to_send.push(packet.clone());
        self.state = ClientState::LoggingIn;
        Ok(packet)
    }

    /// Emits a command packet under a freshly allocated sequence
    ///
    /// The returned packet carries the allocated sequence; the driver
    /// should reuse it for retransmissions so the server can treat
    /// duplicates idempotently.
    pub fn send_command(&mut self, command: &str) -> Result<ClientPacket> {
        self.assert_state(ClientState::LoggedIn, "send_command")?;

        let sequence = self.allocate_sequence()?;
        self.pending.insert(sequence, PendingResponse::default());

        let packet = ClientPacket::command(sequence, command);
        self.to_send.push(packet.clone());
        Ok(packet)
    }

    /// Discards any partial response for a command sequence
    ///
    /// Called by the driver when a command times out or its caller goes
    /// away, freeing the sequence for reuse. Unknown sequences are a
    /// no-op.
    pub fn invalidate_command(&mut self, sequence: u8) {
        self.pending.remove(&sequence);
    }

    /// Feeds one datagram from the server into the machine
    ///
    /// Returns the decoded packet so the driver can surface it as a raw
    /// event. Illegal packets for the current state fail with
    /// [`Error::InvalidState`] and leave the machine untouched.
    pub fn receive_datagram(&mut self, data: &[u8]) -> Result<ServerPacket> {
        let packet = codec::decode_server(data)?;

        match &packet {
            ServerPacket::Login { success } => {
                self.assert_state(ClientState::LoggingIn, "a login response")?;
                if *success {
                    self.state = ClientState::LoggedIn;
                    self.events.push(ProtocolEvent::LoginSuccess);
                } else {
                    self.state = ClientState::Closed;
                    self.events.push(ProtocolEvent::LoginRefused);
                }
            }

            ServerPacket::Command { sequence, total, index, payload } => {
                self.assert_state(ClientState::LoggedIn, "a command response")?;
                self.handle_command_fragment(*sequence, *total, *index, payload.clone())?;
            }

            ServerPacket::Message { sequence, message } => {
                self.assert_state(ClientState::LoggedIn, "a server message")?;
                let text = utf8_text(message)?;

                // The ack must always go out, even for duplicates; it is
                // the only thing that stops the server retransmitting.
                self.to_send.push(ClientPacket::ack(*sequence));
                if self.message_check.check(*sequence) {
                    self.events.push(ProtocolEvent::ServerMessage {
                        sequence: *sequence,
                        message: text,
                    });
                }
            }
        }

        Ok(packet)
    }

    /// Drains the queue of packets waiting to be written
    pub fn packets_to_send(&mut self) -> Vec<ClientPacket> {
        std::mem::take(&mut self.to_send)
    }

    /// Drains the queue of events waiting to be dispatched
    pub fn events_received(&mut self) -> Vec<ProtocolEvent> {
        std::mem::take(&mut self.events)
    }

    /// Resets the protocol to its beginning state
    ///
    /// Invoked by the driver when the connection has timed out and a
    /// fresh login is about to be attempted.
    pub fn reset(&mut self) {
        self.state = ClientState::NoAuth;
        self.next_sequence = 0;
        self.pending.clear();
        self.message_check.reset();
        self.events.clear();
        self.to_send.clear();
    }

    /// Moves the protocol into its terminal state
    pub fn close(&mut self) {
        self.state = ClientState::Closed;
    }

    fn assert_state(&self, expected: ClientState, what: &str) -> Result<()> {
        if self.state != expected {
            return Err(Error::invalid_state(format!(
                "{what} is not legal in the {:?} state",
                self.state
            )));
        }
        Ok(())
    }

    /// Allocates the next free sequence, skipping in-flight ones
    fn allocate_sequence(&mut self) -> Result<u8> {
        for offset in 0..=255u16 {
            let candidate = self.next_sequence.wrapping_add(offset as u8);
            if !self.pending.contains_key(&candidate) {
                self.next_sequence = candidate.wrapping_add(1);
                return Ok(candidate);
            }
        }
        Err(Error::NoAvailableSequence)
    }

    fn handle_command_fragment(
        &mut self,
        sequence: u8,
        total: u8,
        index: u8,
        payload: Bytes,
    ) -> Result<()> {
        let entry = self.pending.get_mut(&sequence).ok_or_else(|| {
            Error::protocol(format!("unexpected command response (sequence {sequence})"))
        })?;

        match entry.total {
            None => entry.total = Some(total),
            Some(expected) if expected != total => {
                return Err(Error::malformed(format!(
                    "response total {total} does not match the previously \
                     seen total {expected} (sequence {sequence})"
                )));
            }
            Some(_) => {}
        }

        if entry.fragments.contains_key(&index) {
            return Err(Error::malformed(format!(
                "response index {index} already received (sequence {sequence})"
            )));
        }
        entry.fragments.insert(index, payload);

        if entry.fragments.len() < total as usize {
            return Ok(());
        }

        // All fragments present; stitch them together in index order.
        let entry = self
            .pending
            .remove(&sequence)
            .expect("pending entry checked above");
        let mut assembled = Vec::new();
        for i in 0..total {
            assembled.extend_from_slice(&entry.fragments[&i]);
        }

        let message = utf8_text(&assembled)?;
        self.events.push(ProtocolEvent::CommandResponse { sequence, message });
        Ok(())
    }
}

fn utf8_text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::malformed("payload is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_server;

    fn logged_in_protocol() -> RconClientProtocol {
        let mut protocol = RconClientProtocol::new();
        protocol.send_login("test").unwrap();
        protocol
            .receive_datagram(&encode_server(&ServerPacket::Login { success: true }).unwrap())
            .unwrap();
        protocol.events_received();
        protocol.packets_to_send();
        protocol
    }

    fn feed(protocol: &mut RconClientProtocol, packet: &ServerPacket) -> Result<ServerPacket> {
        protocol.receive_datagram(&encode_server(packet).unwrap())
    }

    fn fragment(sequence: u8, total: u8, index: u8, payload: &'static [u8]) -> ServerPacket {
        ServerPacket::Command {
            sequence,
            total,
            index,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_login_accepted() {
        let mut protocol = RconClientProtocol::new();
        let packet = protocol.send_login("test").unwrap();
        assert_eq!(packet, ClientPacket::login("test"));
        assert_eq!(protocol.state(), ClientState::LoggingIn);
        assert_eq!(protocol.packets_to_send(), vec![packet]);

        feed(&mut protocol, &ServerPacket::Login { success: true }).unwrap();
        assert_eq!(protocol.state(), ClientState::LoggedIn);
        assert_eq!(protocol.events_received(), vec![ProtocolEvent::LoginSuccess]);
    }

    #[test]
    fn test_login_refused_closes_protocol() {
        let mut protocol = RconClientProtocol::new();
        protocol.send_login("wrong").unwrap();

        feed(&mut protocol, &ServerPacket::Login { success: false }).unwrap();
        assert_eq!(protocol.state(), ClientState::Closed);
        assert_eq!(protocol.events_received(), vec![ProtocolEvent::LoginRefused]);

        // Terminal: any further input is illegal.
        let err = feed(&mut protocol, &ServerPacket::Login { success: true }).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_simple_command_round_trip() {
        let mut protocol = logged_in_protocol();

        let packet = protocol.send_command("players").unwrap();
        assert_eq!(packet.sequence(), Some(0));
        assert_eq!(protocol.packets_to_send(), vec![packet]);

        feed(&mut protocol, &ServerPacket::command_response(0, "lobby empty")).unwrap();
        assert_eq!(
            protocol.events_received(),
            vec![ProtocolEvent::CommandResponse {
                sequence: 0,
                message: "lobby empty".into(),
            }]
        );
        assert_eq!(protocol.pending_commands(), 0);
    }

    #[test]
    fn test_fragmented_response_out_of_order() {
        let mut protocol = logged_in_protocol();
        let sequence = protocol.send_command("status").unwrap().sequence().unwrap();

        feed(&mut protocol, &fragment(sequence, 3, 2, b"CC")).unwrap();
        feed(&mut protocol, &fragment(sequence, 3, 0, b"AA")).unwrap();
        assert!(protocol.events_received().is_empty());

        feed(&mut protocol, &fragment(sequence, 3, 1, b"BB")).unwrap();
        assert_eq!(
            protocol.events_received(),
            vec![ProtocolEvent::CommandResponse {
                sequence,
                message: "AABBCC".into(),
            }]
        );
    }

    #[test]
    fn test_fragment_total_mismatch_is_malformed() {
        let mut protocol = logged_in_protocol();
        let sequence = protocol.send_command("status").unwrap().sequence().unwrap();

        feed(&mut protocol, &fragment(sequence, 3, 0, b"AA")).unwrap();
        let err = feed(&mut protocol, &fragment(sequence, 2, 1, b"BB")).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));

        // The buffered fragment survives, so the real remainder completes.
        feed(&mut protocol, &fragment(sequence, 3, 1, b"BB")).unwrap();
        feed(&mut protocol, &fragment(sequence, 3, 2, b"CC")).unwrap();
        assert_eq!(protocol.events_received().len(), 1);
    }

    #[test]
    fn test_duplicate_fragment_index_is_malformed() {
        let mut protocol = logged_in_protocol();
        let sequence = protocol.send_command("status").unwrap().sequence().unwrap();

        feed(&mut protocol, &fragment(sequence, 2, 0, b"AA")).unwrap();
        let err = feed(&mut protocol, &fragment(sequence, 2, 0, b"AA")).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }

    #[test]
    fn test_unexpected_response_sequence() {
        let mut protocol = logged_in_protocol();
        let err = feed(&mut protocol, &ServerPacket::command_response(9, "?")).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_duplicate_message_acked_but_not_redispatched() {
        let mut protocol = logged_in_protocol();
        let message = ServerPacket::Message {
            sequence: 7,
            message: Bytes::from_static(b"hello"),
        };

        feed(&mut protocol, &message).unwrap();
        feed(&mut protocol, &message).unwrap();

        assert_eq!(
            protocol.events_received(),
            vec![ProtocolEvent::ServerMessage {
                sequence: 7,
                message: "hello".into(),
            }]
        );
        assert_eq!(
            protocol.packets_to_send(),
            vec![ClientPacket::ack(7), ClientPacket::ack(7)]
        );
    }

    #[test]
    fn test_sequence_allocation_skips_outstanding() {
        let mut protocol = logged_in_protocol();
        assert_eq!(protocol.send_command("a").unwrap().sequence(), Some(0));
        assert_eq!(protocol.send_command("b").unwrap().sequence(), Some(1));

        // Complete 0, leave 1 outstanding; the counter moves past both.
        feed(&mut protocol, &ServerPacket::command_response(0, "ok")).unwrap();
        assert_eq!(protocol.send_command("c").unwrap().sequence(), Some(2));

        // Wrap the counter around to 1, which must be skipped.
        protocol.next_sequence = 1;
        assert_eq!(protocol.send_command("d").unwrap().sequence(), Some(3));
    }

    #[test]
    fn test_sequence_reusable_after_completion_and_invalidation() {
        let mut protocol = logged_in_protocol();
        let sequence = protocol.send_command("a").unwrap().sequence().unwrap();
        feed(&mut protocol, &ServerPacket::command_response(sequence, "ok")).unwrap();

        protocol.next_sequence = sequence;
        assert_eq!(protocol.send_command("b").unwrap().sequence(), Some(sequence));

        protocol.invalidate_command(sequence);
        protocol.next_sequence = sequence;
        assert_eq!(protocol.send_command("c").unwrap().sequence(), Some(sequence));
    }

    #[test]
    fn test_sequence_exhaustion() {
        let mut protocol = logged_in_protocol();
        for _ in 0..=255 {
            protocol.send_command("x").unwrap();
        }
        assert!(matches!(
            protocol.send_command("one too many"),
            Err(Error::NoAvailableSequence)
        ));
    }

    #[test]
    fn test_illegal_input_does_not_mutate_state() {
        let mut protocol = RconClientProtocol::new();

        // A command response before any login attempt.
        let err = feed(&mut protocol, &ServerPacket::command_response(0, "?")).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(protocol.state(), ClientState::NoAuth);
        assert!(protocol.events_received().is_empty());
        assert!(protocol.packets_to_send().is_empty());

        // send_command before login is equally illegal.
        assert!(matches!(
            protocol.send_command("players"),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(protocol.state(), ClientState::NoAuth);

        // A second login attempt while one is in flight.
        protocol.send_login("test").unwrap();
        assert!(matches!(
            protocol.send_login("test"),
            Err(Error::InvalidState(_))
        ));

        // A server message during the handshake.
        let message = ServerPacket::Message {
            sequence: 0,
            message: Bytes::from_static(b"early"),
        };
        let err = feed(&mut protocol, &message).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(protocol.state(), ClientState::LoggingIn);
    }

    #[test]
    fn test_reset_returns_to_no_auth() {
        let mut protocol = logged_in_protocol();
        protocol.send_command("a").unwrap();

        protocol.reset();
        assert_eq!(protocol.state(), ClientState::NoAuth);
        assert_eq!(protocol.pending_commands(), 0);
        assert!(protocol.packets_to_send().is_empty());
        assert!(protocol.events_received().is_empty());

        // Sequences restart from zero after a reset.
        protocol.send_login("test").unwrap();
        feed(&mut protocol, &ServerPacket::Login { success: true }).unwrap();
        assert_eq!(protocol.send_command("a").unwrap().sequence(), Some(0));
    }

    #[test]
    fn test_invalid_utf8_response_is_malformed() {
        let mut protocol = logged_in_protocol();
        let sequence = protocol.send_command("status").unwrap().sequence().unwrap();

        let err = feed(&mut protocol, &fragment(sequence, 1, 0, b"\xff\xfe")).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
        assert!(protocol.events_received().is_empty());
    }
}
