//! End-to-end tests for the connector.
//!
//! Each test spins up a real `tokio::net::UdpSocket` on loopback, runs a
//! scriptable server built on the sans-I/O `RconServerProtocol` in a
//! background task, and drives the public client API against it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use bercon::protocol::codec::{decode_client, encode_client, encode_server};
use bercon::protocol::{
    ClientPacket, RconClientProtocol, RconServerProtocol, ServerEvent, ServerPacket,
};
use bercon::{ConnectorConfig, DisconnectReason, Error, Event, RconClient};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// How the scripted server reacts to a command.
enum Response {
    /// Never respond; the client's command must time out.
    Ignore,
    /// Respond with text through the normal chunking path.
    Text(String),
    /// Send these frames verbatim, in the given order.
    Frames(Vec<ServerPacket>),
}

type Responder = Box<dyn Fn(u8, &str) -> Response + Send>;

struct ServerOptions {
    password: &'static str,
    respond: Responder,
    /// Message text sent after a successful login, and how many copies.
    login_message: Option<(String, usize)>,
}

impl ServerOptions {
    fn new(password: &'static str, respond: Responder) -> Self {
        ServerOptions {
            password,
            respond,
            login_message: None,
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    acks: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_server(options: ServerOptions) -> TestServer {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind server socket");
    let addr = socket.local_addr().expect("server local addr");
    let commands = Arc::new(Mutex::new(Vec::new()));
    let acks = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(run_server(
        socket,
        options,
        Arc::clone(&commands),
        Arc::clone(&acks),
    ));

    TestServer {
        addr,
        commands,
        acks,
        task,
    }
}

async fn run_server(
    socket: UdpSocket,
    options: ServerOptions,
    commands: Arc<Mutex<Vec<String>>>,
    acks: Arc<AtomicUsize>,
) {
    let mut protocol = RconServerProtocol::new(options.password);
    let mut buf = vec![0u8; 65507];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(_) => return,
        };
        let datagram = &buf[..len];

        if let Ok(ClientPacket::Message { .. }) = decode_client(datagram) {
            acks.fetch_add(1, Ordering::SeqCst);
        }

        // Duplicate acks and retransmissions produce errors we don't
        // care about here.
        let _ = protocol.receive_datagram(datagram);

        let mut extra: Vec<ServerPacket> = Vec::new();
        for event in protocol.events_received() {
            match event {
                ServerEvent::AuthAttempt { success: true } => {
                    if let Some((text, copies)) = &options.login_message {
                        let packet = protocol.send_message(text).expect("send message");
                        for _ in 1..*copies {
                            extra.push(packet.clone());
                        }
                    }
                }
                ServerEvent::Command { sequence, command } => {
                    commands.lock().unwrap().push(command.clone());
                    match (options.respond)(sequence, &command) {
                        Response::Ignore => {}
                        Response::Text(text) => {
                            protocol
                                .respond_to_command(sequence, &text)
                                .expect("respond to command");
                        }
                        Response::Frames(frames) => extra.extend(frames),
                    }
                }
                _ => {}
            }
        }

        for packet in protocol.packets_to_send().into_iter().chain(extra) {
            let bytes = encode_server(&packet).expect("encode server packet");
            socket.send_to(&bytes, peer).await.expect("send to client");
        }
    }
}

fn fast_config() -> ConnectorConfig {
    let mut config = ConnectorConfig::default();
    config.connection_timeout = Duration::from_millis(500);
    config.login_timeout = Duration::from_millis(100);
    config.command_timeout = Duration::from_millis(500);
    config
}

fn fragment(sequence: u8, total: u8, index: u8, payload: &str) -> ServerPacket {
    ServerPacket::Command {
        sequence,
        total,
        index,
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
}

async fn next_matching<F>(events: &mut broadcast::Receiver<Event>, predicate: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn login_and_simple_command() {
    let server = spawn_server(ServerOptions::new(
        "test",
        Box::new(|_, command| match command {
            "players" => Response::Text("lobby empty".into()),
            _ => Response::Text(String::new()),
        }),
    ))
    .await;

    let client = RconClient::with_config(fast_config());
    let session = client
        .connect("127.0.0.1", server.addr.port(), "test")
        .await
        .expect("connect");

    assert!(session.is_running());
    assert!(session.is_connected());
    assert!(session.is_logged_in());

    // The first subscriber observes the handshake's Login event.
    let mut events = session.subscribe();
    next_matching(&mut events, |e| matches!(e, Event::Login)).await;

    let response = session.send_command("players").await.expect("send command");
    assert_eq!(response, "lobby empty");

    let event = next_matching(&mut events, |e| matches!(e, Event::CommandResponse { .. })).await;
    assert_eq!(
        event,
        Event::CommandResponse {
            sequence: 0,
            message: "lobby empty".into(),
        }
    );
}

#[tokio::test]
async fn login_refused_surfaces_to_caller() {
    let server = spawn_server(ServerOptions::new(
        "test",
        Box::new(|_, _| Response::Ignore),
    ))
    .await;

    let client = RconClient::with_config(fast_config());
    let result = timeout(
        Duration::from_secs(5),
        client.connect("127.0.0.1", server.addr.port(), "wrong"),
    )
    .await
    .expect("refusal must not trigger retries");

    assert!(matches!(result, Err(Error::LoginRefused)));
}

#[tokio::test]
async fn login_times_out_against_a_silent_server() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            let _ = socket.recv_from(&mut buf).await;
        }
    });

    let client = RconClient::with_config(fast_config());
    let result = timeout(
        Duration::from_secs(5),
        client.connect("127.0.0.1", addr.port(), "test"),
    )
    .await
    .expect("connect must give up by connection_timeout");

    assert!(matches!(result, Err(Error::LoginTimeout)));
    silent.abort();
}

#[tokio::test]
async fn fragmented_response_is_reassembled_in_index_order() {
    let server = spawn_server(ServerOptions::new(
        "test",
        Box::new(|sequence, command| match command {
            "status" => Response::Frames(vec![
                fragment(sequence, 3, 2, "CC"),
                fragment(sequence, 3, 0, "AA"),
                fragment(sequence, 3, 1, "BB"),
            ]),
            _ => Response::Text(String::new()),
        }),
    ))
    .await;

    let client = RconClient::with_config(fast_config());
    let session = client
        .connect("127.0.0.1", server.addr.port(), "test")
        .await
        .expect("connect");

    let response = session.send_command("status").await.expect("send command");
    assert_eq!(response, "AABBCC");
}

#[tokio::test]
async fn duplicate_message_yields_one_event_and_two_acks() {
    let mut options = ServerOptions::new("test", Box::new(|_, _| Response::Text(String::new())));
    options.login_message = Some(("hello".into(), 2));
    let server = spawn_server(options).await;

    let client = RconClient::with_config(fast_config());
    let session = client
        .connect("127.0.0.1", server.addr.port(), "test")
        .await
        .expect("connect");

    let mut events = session.subscribe();
    let event = next_matching(&mut events, |e| matches!(e, Event::ServerMessage { .. })).await;
    assert_eq!(
        event,
        Event::ServerMessage {
            sequence: 0,
            message: "hello".into(),
        }
    );

    // Both copies must be acknowledged, but only one event dispatched.
    wait_until(|| server.acks.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, Event::ServerMessage { .. }),
            "duplicate message was dispatched: {event:?}"
        );
    }
}

#[tokio::test]
async fn fire_and_forget_returns_without_a_response() {
    let server = spawn_server(ServerOptions::new(
        "test",
        Box::new(|_, _| Response::Ignore),
    ))
    .await;

    let client = RconClient::with_config(fast_config());
    let session = client
        .connect("127.0.0.1", server.addr.port(), "test")
        .await
        .expect("connect");

    timeout(Duration::from_millis(100), session.send("say hello"))
        .await
        .expect("send must not wait for a response")
        .expect("send");

    wait_until(|| server.commands.lock().unwrap().contains(&"say hello".to_string())).await;
}

#[tokio::test]
async fn unanswered_command_times_out() {
    let server = spawn_server(ServerOptions::new(
        "test",
        Box::new(|_, _| Response::Ignore),
    ))
    .await;

    let client = RconClient::with_config(fast_config());
    let session = client
        .connect("127.0.0.1", server.addr.port(), "test")
        .await
        .expect("connect");

    let result = session.send_command("void").await;
    assert!(matches!(result, Err(Error::CommandFailed(_))));

    // The command was retransmitted under one sequence until the deadline.
    let seen = server.commands.lock().unwrap().len();
    assert_eq!(seen, 1, "server must dedup retransmissions, saw {seen}");
}

#[tokio::test]
async fn closing_fails_pending_commands_and_stops_tasks() {
    let server = spawn_server(ServerOptions::new(
        "test",
        Box::new(|_, _| Response::Ignore),
    ))
    .await;

    let mut config = fast_config();
    config.command_timeout = Duration::from_secs(30);
    let client = RconClient::with_config(config);
    let mut session = client
        .connect("127.0.0.1", server.addr.port(), "test")
        .await
        .expect("connect");

    let mut events = session.subscribe();
    let (result, _) = tokio::join!(session.send_command("stuck"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.close();
    });
    assert!(matches!(result, Err(Error::NotConnected)));

    session.wait_until_closed().await;
    assert!(!session.is_running());
    assert!(!session.is_connected());
    assert!(!session.is_logged_in());

    next_matching(&mut events, |e| {
        matches!(e, Event::Disconnected(DisconnectReason::Closed))
    })
    .await;
}

#[tokio::test]
async fn keep_alive_probe_is_sent_during_idle_periods() {
    let server = spawn_server(ServerOptions::new(
        "test",
        Box::new(|_, _| Response::Text(String::new())),
    ))
    .await;

    let mut config = fast_config();
    config.keep_alive_interval = Duration::from_millis(200);
    let client = RconClient::with_config(config);
    let session = client
        .connect("127.0.0.1", server.addr.port(), "test")
        .await
        .expect("connect");

    // The pump checks idleness on a one second tick.
    wait_until(|| server.commands.lock().unwrap().iter().any(String::is_empty)).await;
    assert!(session.is_logged_in());
}

// ---------------------------------------------------------------------------
// Sans-I/O conversation sweep
// ---------------------------------------------------------------------------

/// Shuttles bytes directly between the two protocol machines: 512
/// commands and 512 messages, so every sequence counter wraps twice and
/// the dedup window has to forget old sequences to keep working.
#[test]
fn protocol_conversation_sweep() {
    let mut client = RconClientProtocol::new();
    let mut server = RconServerProtocol::new("test");

    let login = client.send_login("test").unwrap();
    client.packets_to_send();
    server
        .receive_datagram(&encode_client(&login).unwrap())
        .unwrap();
    for packet in server.packets_to_send() {
        client
            .receive_datagram(&encode_server(&packet).unwrap())
            .unwrap();
    }
    assert!(client.is_logged_in());
    assert_eq!(client.events_received().len(), 1);

    for i in 0..512u32 {
        let packet = client.send_command(&i.to_string()).unwrap();
        client.packets_to_send();
        let datagram = encode_client(&packet).unwrap();

        server.receive_datagram(&datagram).unwrap();
        let events = server.events_received();
        assert_eq!(
            events,
            vec![ServerEvent::Command {
                sequence: packet.sequence().unwrap(),
                command: i.to_string(),
            }],
            "iteration {i}"
        );

        // A retransmission of the same command must not re-dispatch.
        server.receive_datagram(&datagram).unwrap();
        assert!(server.events_received().is_empty(), "iteration {i}");

        server
            .respond_to_command(packet.sequence().unwrap(), "ok")
            .unwrap();
        for packet in server.packets_to_send() {
            client
                .receive_datagram(&encode_server(&packet).unwrap())
                .unwrap();
        }
        assert_eq!(client.events_received().len(), 1, "iteration {i}");
    }

    for i in 0..512u32 {
        let packet = server.send_message(&i.to_string()).unwrap();
        server.packets_to_send();
        let datagram = encode_server(&packet).unwrap();

        client.receive_datagram(&datagram).unwrap();
        assert_eq!(client.events_received().len(), 1, "iteration {i}");
        let acks = client.packets_to_send();
        assert_eq!(acks.len(), 1, "iteration {i}");

        // The duplicate is acknowledged again but dispatches nothing.
        client.receive_datagram(&datagram).unwrap();
        assert!(client.events_received().is_empty(), "iteration {i}");
        let duplicate_acks = client.packets_to_send();
        assert_eq!(duplicate_acks.len(), 1, "iteration {i}");

        server
            .receive_datagram(&encode_client(&acks[0]).unwrap())
            .unwrap();
        assert_eq!(
            server.events_received(),
            vec![ServerEvent::MessageAck {
                sequence: packet.sequence().unwrap(),
            }],
            "iteration {i}"
        );

        // The second ack refers to a message no longer pending.
        assert!(server
            .receive_datagram(&encode_client(&duplicate_acks[0]).unwrap())
            .is_err());
    }
}
