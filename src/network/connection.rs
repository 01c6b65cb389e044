use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{ConnectorConfig, Error, Result, LAST_RECEIVED_TIMEOUT, MAX_PACKET_SIZE};
use crate::protocol::state::ProtocolEvent;
use crate::protocol::{ClientPacket, ClientState, PacketCodec, RconClientProtocol};
use crate::util::ActivityClock;
use super::commander::Commander;
use super::event::{DisconnectReason, Event, LoginFailureKind};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State shared between the supervisor task and session handles
struct Shared {
    config: ConnectorConfig,
    peer: SocketAddr,
    password: String,
    /// The protocol state machine; the sole owner of protocol state
    machine: Mutex<RconClientProtocol>,
    /// Callers waiting on command responses
    commander: Mutex<Commander>,
    /// Traffic timestamps driving keep-alive and the silence watchdog
    activity: Mutex<ActivityClock>,
    /// Current socket; replaced on reconnect, absent while down
    socket: Mutex<Option<Arc<UdpSocket>>>,
    event_tx: broadcast::Sender<Event>,
    token: CancellationToken,
    logged_in: AtomicBool,
    running: AtomicBool,
}

/// Drives the protocol state machine against a UDP endpoint
///
/// Cheap to clone; all clones share one session. The supervisor task
/// created by [`run`] owns the connection lifecycle: login handshake,
/// datagram pumping, keep-alive probing, the 45 second silence watchdog,
/// and reconnection with exponential backoff.
///
/// [`run`]: Connection::run
#[derive(Clone)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a connection in its disconnected state
    pub fn new(config: ConnectorConfig, peer: SocketAddr, password: &str) -> Result<Self> {
        config.validate()?;
        let machine = RconClientProtocol::with_nonce_window(config.nonce_window)?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Connection {
            shared: Arc::new(Shared {
                config,
                peer,
                password: password.to_owned(),
                machine: Mutex::new(machine),
                commander: Mutex::new(Commander::new()),
                activity: Mutex::new(ActivityClock::new()),
                socket: Mutex::new(None),
                event_tx,
                token: CancellationToken::new(),
                logged_in: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Returns a receiver for the session's event stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.event_tx.subscribe()
    }

    /// Requests that the supervisor shut the session down
    pub fn close(&self) {
        self.shared.token.cancel();
    }

    /// Returns true while the supervisor task is alive
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns true while a socket to the server is open
    pub fn is_connected(&self) -> bool {
        self.shared.socket.lock().unwrap().is_some()
    }

    /// Returns true while the server considers us authenticated
    pub fn is_logged_in(&self) -> bool {
        self.shared.logged_in.load(Ordering::SeqCst)
    }

    /// Supervisor: maintains the connection until closed or given up
    ///
    /// The first login outcome is reported through `ready` so that
    /// `connect` can surface connect-fatal failures; afterwards failures
    /// feed the reconnect loop instead.
    pub async fn run(self, ready: oneshot::Sender<Result<()>>) {
        self.shared.running.store(true, Ordering::SeqCst);
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            if self.shared.token.is_cancelled() {
                break;
            }

            match self.establish().await {
                Ok(()) => {
                    attempt = 0;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }

                    let reason = self.session_loop().await;
                    let closed = reason == DisconnectReason::Closed;
                    self.teardown(reason);
                    if closed {
                        break;
                    }
                }
                Err(error) => {
                    if let Some(tx) = ready.take() {
                        // The initial connection surfaces its failure.
                        let _ = tx.send(Err(error));
                        break;
                    }
                    if matches!(error, Error::LoginTimeout) {
                        self.publish(Event::LoginFailure(LoginFailureKind::Timeout));
                    }
                    if !error.is_session_fatal() {
                        // Refused credentials or an unencodable login will
                        // fail the same way on every attempt.
                        warn!(%error, "giving up on the connection");
                        break;
                    }
                    warn!(%error, "connection attempt failed");
                }
            }

            if self.shared.token.is_cancelled() {
                break;
            }
            match self.shared.config.reconnect.delay_for_attempt(attempt) {
                Some(delay) => {
                    info!(attempt, ?delay, "reconnecting after backoff");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shared.token.cancelled() => break,
                    }
                }
                None => {
                    warn!("reconnect attempts exhausted");
                    break;
                }
            }
            attempt += 1;
        }

        self.finalize();
    }

    /// Sends a command and waits for its assembled response
    pub async fn send_command(&self, command: &str) -> Result<String> {
        self.shared.config.encoding.validate(command)?;
        if !self.is_logged_in() {
            return Err(Error::NotConnected);
        }

        let packet = self.start_command(command)?;
        let sequence = packet.sequence().expect("command packets carry a sequence");
        let response = self.shared.commander.lock().unwrap().register(sequence);

        // Frees the sequence if the caller times out or is cancelled;
        // harmless after a completed response.
        let _guard = SequenceGuard {
            connection: self.clone(),
            sequence,
        };

        let overall = sleep(self.shared.config.command_timeout);
        tokio::pin!(overall);
        tokio::pin!(response);
        // The first tick fires immediately and performs the initial send.
        let mut retry = interval(self.shared.config.command_retry_interval());
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => return Err(Error::NotConnected),
                _ = &mut overall => {
                    warn!(
                        sequence,
                        attempts = self.shared.config.command_attempts,
                        "command timed out",
                    );
                    return Err(Error::command(format!("no response to {command:?}")));
                }
                _ = retry.tick() => self.send_packet(&packet).await?,
                result = &mut response => {
                    return result.map_err(|_| Error::NotConnected);
                }
            }
        }
    }

    /// Sends a command without awaiting its response
    pub async fn fire_and_forget(&self, command: &str) -> Result<()> {
        self.shared.config.encoding.validate(command)?;
        if !self.is_logged_in() {
            return Err(Error::NotConnected);
        }

        let packet = self.start_command(command)?;
        let sequence = packet.sequence().expect("command packets carry a sequence");
        self.send_packet(&packet).await?;

        // Free the sequence once the response window has passed; a reply
        // arriving before then still reaches event subscribers.
        let connection = self.clone();
        tokio::spawn(async move {
            sleep(connection.shared.config.command_timeout).await;
            let mut machine = connection.shared.machine.lock().unwrap();
            machine.invalidate_command(sequence);
        });

        Ok(())
    }

    /// Allocates a sequence for a command and returns its packet
    fn start_command(&self, command: &str) -> Result<ClientPacket> {
        let mut machine = self.shared.machine.lock().unwrap();
        let packet = machine.send_command(command)?;
        // The retry loop owns delivery of this packet.
        machine.packets_to_send();
        Ok(packet)
    }

    /// Binds a fresh socket and runs the login handshake
    async fn establish(&self) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.shared.peer).await?;
        let socket = Arc::new(socket);
        *self.shared.socket.lock().unwrap() = Some(socket.clone());
        *self.shared.activity.lock().unwrap() = ActivityClock::new();

        let login = {
            let mut machine = self.shared.machine.lock().unwrap();
            machine.reset();
            let packet = machine.send_login(&self.shared.password)?;
            // The retransmit loop below owns delivery.
            machine.packets_to_send();
            packet
        };

        debug!(peer = %self.shared.peer, "attempting login");
        let deadline = sleep(self.shared.config.connection_timeout);
        tokio::pin!(deadline);
        // The first tick fires immediately and performs the initial send.
        let mut retry = interval(self.shared.config.login_timeout);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => return Err(Error::NotConnected),
                _ = &mut deadline => return Err(Error::LoginTimeout),
                _ = retry.tick() => self.send_packet(&login).await?,
                received = socket.recv_from(&mut buf) => {
                    let (len, addr) = received?;
                    if addr != self.shared.peer {
                        debug!(%addr, "ignoring datagram from unknown address");
                        continue;
                    }
                    self.process_datagram(&buf[..len]).await;

                    match self.shared.machine.lock().unwrap().state() {
                        ClientState::LoggedIn => return Ok(()),
                        ClientState::Closed => return Err(Error::LoginRefused),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Pumps datagrams and timers for one established session
    async fn session_loop(&self) -> DisconnectReason {
        let socket = match self.current_socket() {
            Some(socket) => socket,
            None => return DisconnectReason::Closed,
        };

        let silence_limit = Duration::from_secs(LAST_RECEIVED_TIMEOUT);
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = self.shared.token.cancelled() => return DisconnectReason::Closed,
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => {
                            if addr != self.shared.peer {
                                debug!(%addr, "ignoring datagram from unknown address");
                                continue;
                            }
                            self.process_datagram(&buf[..len]).await;
                        }
                        Err(error) => {
                            warn!(%error, "socket error during session");
                            return DisconnectReason::SocketError(error.to_string());
                        }
                    }
                }
                _ = tick.tick() => {
                    let (silence, idle) = {
                        let activity = self.shared.activity.lock().unwrap();
                        (activity.silence(), activity.idle())
                    };

                    if silence >= silence_limit {
                        info!(?silence, "server has timed out");
                        return DisconnectReason::Timeout;
                    }
                    if idle >= self.shared.config.keep_alive_interval {
                        self.begin_keep_alive();
                    }
                }
            }
        }
    }

    /// Issues the keep-alive probe without blocking the pump
    fn begin_keep_alive(&self) {
        // Stamp the clock up front so one quiet period triggers one probe.
        self.shared.activity.lock().unwrap().mark_command();

        let connection = self.clone();
        tokio::spawn(async move {
            debug!("sending keep-alive command");
            let probe = connection.shared.config.keep_alive_command.clone();
            if let Err(error) = connection.send_command(&probe).await {
                debug!(%error, "keep-alive command failed");
            }
        });
    }

    /// Feeds one datagram to the machine and fans out the results
    async fn process_datagram(&self, data: &[u8]) {
        let (packet, events, to_send) = {
            let mut machine = self.shared.machine.lock().unwrap();
            match machine.receive_datagram(data) {
                Ok(packet) => (packet, machine.events_received(), machine.packets_to_send()),
                Err(error) => {
                    debug!(%error, "ignoring datagram");
                    return;
                }
            }
        };

        self.shared.activity.lock().unwrap().mark_received();
        debug!(kind = ?packet.kind(), "received packet");
        self.publish(Event::RawPacket(packet));

        for event in events {
            self.handle_event(event);
        }
        for packet in to_send {
            if let Err(error) = self.send_packet(&packet).await {
                warn!(%error, "failed to send acknowledgement");
            }
        }
    }

    fn handle_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::LoginSuccess => {
                self.shared.logged_in.store(true, Ordering::SeqCst);
                info!(peer = %self.shared.peer, "logged in");
                self.publish(Event::Login);
            }
            ProtocolEvent::LoginRefused => {
                self.shared.logged_in.store(false, Ordering::SeqCst);
                warn!("password authentication was denied");
                self.publish(Event::LoginFailure(LoginFailureKind::Refused));
            }
            ProtocolEvent::CommandResponse { sequence, message } => {
                let mut commander = self.shared.commander.lock().unwrap();
                commander.complete(sequence, message.clone());
                drop(commander);
                self.publish(Event::CommandResponse { sequence, message });
            }
            ProtocolEvent::ServerMessage { sequence, message } => {
                self.publish(Event::ServerMessage { sequence, message });
            }
        }
    }

    /// Encodes and writes one packet to the current socket
    async fn send_packet(&self, packet: &ClientPacket) -> Result<()> {
        let socket = self.current_socket().ok_or(Error::NotConnected)?;

        let mut buffer = BytesMut::new();
        PacketCodec::new().encode(packet.clone(), &mut buffer)?;
        socket.send(&buffer).await?;
        debug!(kind = ?packet.kind(), "sent packet");

        if matches!(packet, ClientPacket::Command { .. }) {
            self.shared.activity.lock().unwrap().mark_command();
        }
        Ok(())
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.shared.socket.lock().unwrap().clone()
    }

    fn publish(&self, event: Event) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.shared.event_tx.send(event);
    }

    /// Clears per-session state after a disconnection
    fn teardown(&self, reason: DisconnectReason) {
        self.shared.logged_in.store(false, Ordering::SeqCst);
        *self.shared.socket.lock().unwrap() = None;
        self.shared.commander.lock().unwrap().fail_all();
        self.shared.machine.lock().unwrap().reset();
        self.publish(Event::Disconnected(reason));
    }

    /// Final cleanup once the supervisor exits
    fn finalize(&self) {
        self.shared.logged_in.store(false, Ordering::SeqCst);
        *self.shared.socket.lock().unwrap() = None;
        if let Ok(mut commander) = self.shared.commander.lock() {
            commander.fail_all();
        }
        if let Ok(mut machine) = self.shared.machine.lock() {
            machine.close();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        debug!("supervisor stopped");
    }
}

/// Releases a command sequence when its awaiter goes away
struct SequenceGuard {
    connection: Connection,
    sequence: u8,
}

impl Drop for SequenceGuard {
    fn drop(&mut self) {
        if let Ok(mut machine) = self.connection.shared.machine.lock() {
            machine.invalidate_command(self.sequence);
        }
        if let Ok(mut commander) = self.connection.shared.commander.lock() {
            commander.cancel(self.sequence);
        }
    }
}
