//! Integration test: boots an in-process WebSocket server that plays the
//! assistant service, connects a real [`DesktopClient`], and drives the
//! handshake, outbound ordering, reconnect flush, dispatch and commands.

use std::net::SocketAddr;
use std::time::Duration;

use dl_client::{
    ClientHandle, ConnectionState, DesktopClient, DesktopClientBuilder, Delivery, Envelope,
    MessageType, UiEvent,
};
use dl_domain::config::Config;
use dl_protocol::{
    ChatPayload, CommandPayload, CommandResultPayload, ErrorPayload, HelloPayload, WelcomePayload,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Welcome,
    RejectAuth,
}

/// One accepted connection, seen from the server side.
struct ServerConn {
    uri: String,
    hello: HelloPayload,
    /// Raw text frames to push to the client.  Dropping this closes the
    /// connection.
    send: mpsc::Sender<String>,
    /// Envelopes received from the client, heartbeats filtered out.
    recv: mpsc::Receiver<Envelope>,
}

impl ServerConn {
    async fn push(&self, envelope: Envelope) {
        self.send.send(envelope.encode().unwrap()).await.unwrap();
    }

    async fn next(&mut self) -> Envelope {
        tokio::time::timeout(WAIT, self.recv.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("connection closed")
    }

    async fn next_of(&mut self, kind: MessageType) -> Envelope {
        loop {
            let env = self.next().await;
            if env.kind == kind {
                return env;
            }
        }
    }
}

async fn start_mini_server(mode: Mode) -> (SocketAddr, mpsc::Receiver<ServerConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let mut uri = String::new();
                let ws = tokio_tungstenite::accept_hdr_async(
                    stream,
                    |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        uri = req.uri().to_string();
                        Ok(resp)
                    },
                )
                .await
                .unwrap();
                let (mut sink, mut stream) = ws.split();

                let hello = loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            let env = Envelope::decode(&text).unwrap();
                            if env.kind == MessageType::Hello {
                                break env.payload::<HelloPayload>().unwrap();
                            }
                        }
                        _ => return,
                    }
                };

                if mode == Mode::RejectAuth {
                    let reject = Envelope::from_payload(
                        MessageType::Error,
                        &ErrorPayload {
                            code: "auth_rejected".into(),
                            message: "bad token".into(),
                        },
                    )
                    .unwrap();
                    let _ = sink.send(Message::Text(reject.encode().unwrap())).await;
                    let _ = sink.close().await;
                    return;
                }

                let welcome = Envelope::from_payload(
                    MessageType::Welcome,
                    &WelcomePayload {
                        session_id: Some("s-1".into()),
                        server_version: "0.0.0-test".into(),
                        heartbeat_interval_secs: None,
                    },
                )
                .unwrap();
                if sink.send(Message::Text(welcome.encode().unwrap())).await.is_err() {
                    return;
                }

                let (send_tx, mut send_rx) = mpsc::channel::<String>(16);
                let (recv_tx, recv_rx) = mpsc::channel::<Envelope>(64);
                let conn = ServerConn {
                    uri,
                    hello,
                    send: send_tx,
                    recv: recv_rx,
                };
                if conn_tx.send(conn).await.is_err() {
                    return;
                }

                let read_task = tokio::spawn(async move {
                    while let Some(Ok(msg)) = stream.next().await {
                        if let Message::Text(text) = msg {
                            if let Ok(env) = Envelope::decode(&text) {
                                if env.kind == MessageType::Heartbeat {
                                    continue;
                                }
                                let _ = recv_tx.send(env).await;
                            }
                        }
                    }
                });

                while let Some(text) = send_rx.recv().await {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // The test dropped its handle: hang up.
                let _ = sink.close().await;
                read_task.abort();
            });
        }
    });

    (addr, conn_rx)
}

fn config_for(addr: SocketAddr) -> Config {
    let mut config = Config::default();
    config.server.url = format!("http://{addr}");
    config.server.ws_url = Some(format!("ws://{addr}/ws/client"));
    config.server.token = Some("secret".into());
    config.server.client_id = Some("test-client".into());
    config.reconnect.base_delay_ms = 300;
    config.reconnect.max_delay_ms = 1_000;
    config.monitor.enabled = false;
    config
}

fn spawn(client: DesktopClient) -> (ClientHandle, CancellationToken) {
    let handle = client.handle();
    let shutdown = CancellationToken::new();
    client.spawn(shutdown.clone());
    (handle, shutdown)
}

async fn wait_for_state(handle: &ClientHandle, want: ConnectionState) {
    let mut rx = handle.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("never reached {want}"))
        .unwrap();
}

async fn next_conn(rx: &mut mpsc::Receiver<ServerConn>) -> ServerConn {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("client never connected")
        .expect("server stopped")
}

async fn next_ui_event<F: Fn(&UiEvent) -> bool>(rx: &mut broadcast::Receiver<UiEvent>, pred: F) -> UiEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("ui channel closed"),
            }
        }
    })
    .await
    .expect("ui event never arrived")
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_then_chat_arrives_in_order() {
    let (addr, mut conns) = start_mini_server(Mode::Welcome).await;
    let client = DesktopClientBuilder::new(config_for(addr)).build().unwrap();
    let (handle, shutdown) = spawn(client);

    let mut conn = next_conn(&mut conns).await;
    wait_for_state(&handle, ConnectionState::Connected).await;

    assert!(conn.uri.contains("token=secret"), "uri: {}", conn.uri);
    assert!(conn.uri.contains("client_id=test-client"));
    assert_eq!(conn.hello.client_id, "test-client");
    assert!(!conn.hello.resumed);
    assert_eq!(conn.hello.capabilities, vec!["capture_state", "screenshot"]);
    assert_eq!(handle.session_id().as_deref(), Some("s-1"));

    for n in 0..20 {
        handle.send_chat(format!("msg-{n}")).await.unwrap();
    }
    for n in 0..20 {
        let env = conn.next_of(MessageType::Chat).await;
        let chat: ChatPayload = env.payload().unwrap();
        assert_eq!(chat.text, format!("msg-{n}"));
        assert_eq!(chat.session_id.as_deref(), Some("s-1"));
    }

    shutdown.cancel();
    wait_for_state(&handle, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn queued_messages_flush_in_order_after_reconnect() {
    let (addr, mut conns) = start_mini_server(Mode::Welcome).await;
    let client = DesktopClientBuilder::new(config_for(addr))
        .autoconnect(false)
        .build()
        .unwrap();
    let (handle, shutdown) = spawn(client);
    let mut transitions = handle.observe_state();

    for n in 0..3 {
        let delivery = handle.send_chat(format!("offline-{n}")).await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
    }

    handle.connect();
    let mut first = next_conn(&mut conns).await;
    for n in 0..3 {
        let chat: ChatPayload = first.next_of(MessageType::Chat).await.payload().unwrap();
        assert_eq!(chat.text, format!("offline-{n}"));
    }
    wait_for_state(&handle, ConnectionState::Connected).await;

    // Server hangs up; messages sent during the back-off wait are queued.
    drop(first);
    wait_for_state(&handle, ConnectionState::Reconnecting).await;
    let delivery = handle.send_chat("during-outage").await.unwrap();
    assert_eq!(delivery, Delivery::Queued);

    let mut second = next_conn(&mut conns).await;
    assert!(second.hello.resumed);
    assert_eq!(second.hello.session_id.as_deref(), Some("s-1"));
    assert!(second.uri.contains("session_id=s-1"));
    let chat: ChatPayload = second.next_of(MessageType::Chat).await.payload().unwrap();
    assert_eq!(chat.text, "during-outage");
    wait_for_state(&handle, ConnectionState::Connected).await;
    assert_eq!(handle.stats().total_reconnects, 1);

    let mut seen = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        seen.push(state);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );

    shutdown.cancel();
}

#[tokio::test]
async fn repeated_auth_rejection_ends_in_failed() {
    let (addr, _conns) = start_mini_server(Mode::RejectAuth).await;
    let mut config = config_for(addr);
    config.reconnect.base_delay_ms = 20;
    config.reconnect.max_auth_failures = 2;
    let client = DesktopClientBuilder::new(config).build().unwrap();
    let mut events = client.handle().subscribe();
    let (handle, shutdown) = spawn(client);

    let event = next_ui_event(&mut events, |e| matches!(e, UiEvent::AuthRequired(_))).await;
    assert!(matches!(event, UiEvent::AuthRequired(reason) if reason.contains("bad token")));
    wait_for_state(&handle, ConnectionState::Failed).await;

    // Failed is sticky until connect() is requested again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.state(), ConnectionState::Failed);

    handle.close();
    wait_for_state(&handle, ConnectionState::Disconnected).await;
    shutdown.cancel();
}

#[tokio::test]
async fn exhausted_retry_budget_fails_until_connect() {
    // Nothing listens on this port once the listener is dropped.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = config_for(addr);
    config.reconnect.base_delay_ms = 20;
    config.reconnect.max_delay_ms = 50;
    config.reconnect.max_attempts = 3;
    let client = DesktopClientBuilder::new(config).build().unwrap();
    let mut transitions = client.handle().observe_state();
    let (handle, shutdown) = spawn(client);

    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Ok(state) = transitions.recv().await {
            seen.push(state);
            if state == ConnectionState::Failed {
                break;
            }
        }
    })
    .await
    .expect("never gave up");

    use ConnectionState::*;
    assert_eq!(
        seen,
        vec![
            Connecting,
            Reconnecting,
            Connecting,
            Reconnecting,
            Connecting,
            Reconnecting,
            Failed,
        ]
    );

    // Failed is sticky until connect() is requested again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.state(), Failed);
    assert!(transitions.try_recv().is_err());

    handle.connect();
    let next = tokio::time::timeout(WAIT, transitions.recv())
        .await
        .expect("connect() did not restart the cycle")
        .unwrap();
    assert_eq!(next, Connecting);

    shutdown.cancel();
}

#[tokio::test]
async fn inbound_chat_and_unknown_types_reach_the_ui() {
    let (addr, mut conns) = start_mini_server(Mode::Welcome).await;
    let client = DesktopClientBuilder::new(config_for(addr)).build().unwrap();
    let mut events = client.handle().subscribe();
    let (_handle, shutdown) = spawn(client);
    let conn = next_conn(&mut conns).await;

    conn.push(
        Envelope::from_payload(
            MessageType::Chat,
            &ChatPayload {
                text: "hi there".into(),
                session_id: Some("s-1".into()),
                streaming: false,
                is_complete: true,
            },
        )
        .unwrap(),
    )
    .await;
    let event = next_ui_event(&mut events, |e| matches!(e, UiEvent::Chat(_))).await;
    assert!(matches!(event, UiEvent::Chat(chat) if chat.text == "hi there"));

    conn.push(Envelope::new(
        MessageType::from("calendar_sync"),
        serde_json::json!({"events": 2}),
    ))
    .await;
    let event = next_ui_event(&mut events, |e| matches!(e, UiEvent::Opaque(_))).await;
    match event {
        UiEvent::Opaque(env) => {
            assert_eq!(env.kind.as_str(), "calendar_sync");
            assert_eq!(env.data["events"], 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn commands_always_get_a_result() {
    let (addr, mut conns) = start_mini_server(Mode::Welcome).await;
    let client = DesktopClientBuilder::new(config_for(addr)).build().unwrap();
    let (_handle, shutdown) = spawn(client);
    let mut conn = next_conn(&mut conns).await;

    let command = |name: &str, id: &str| {
        Envelope::from_payload(
            MessageType::Command,
            &CommandPayload {
                command: name.into(),
                request_id: id.into(),
                params: serde_json::Value::Null,
            },
        )
        .unwrap()
        .with_correlation_id(format!("corr-{id}"))
    };

    conn.push(command("capture_state", "r1")).await;
    let env = conn.next_of(MessageType::CommandResult).await;
    assert_eq!(env.correlation_id.as_deref(), Some("corr-r1"));
    let result: CommandResultPayload = env.payload().unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.request_id, "r1");
    assert!(result.result["timestamp"].is_string());

    conn.push(command("launch_rocket", "r2")).await;
    let env = conn.next_of(MessageType::CommandResult).await;
    let result: CommandResultPayload = env.payload().unwrap();
    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("not_found"));

    shutdown.cancel();
}

#[tokio::test]
async fn malformed_frames_past_threshold_force_reconnect() {
    let (addr, mut conns) = start_mini_server(Mode::Welcome).await;
    let mut config = config_for(addr);
    config.bridge.protocol_error_threshold = 3;
    let client = DesktopClientBuilder::new(config).build().unwrap();
    let mut events = client.handle().subscribe();
    let (handle, shutdown) = spawn(client);

    let first = next_conn(&mut conns).await;
    for _ in 0..3 {
        first.send.send("{not json".into()).await.unwrap();
    }
    next_ui_event(&mut events, |e| matches!(e, UiEvent::ProtocolError(_))).await;

    let second = next_conn(&mut conns).await;
    assert!(second.hello.resumed);
    wait_for_state(&handle, ConnectionState::Connected).await;
    assert!(handle.stats().protocol_errors >= 3);

    shutdown.cancel();
}

#[tokio::test]
async fn login_token_is_used_for_the_stream() {
    use axum::routing::post;
    use axum::{Json, Router};

    let (ws_addr, mut conns) = start_mini_server(Mode::Welcome).await;

    let app = Router::new().route(
        "/api/auth/login",
        post(|Json(body): Json<serde_json::Value>| async move {
            assert_eq!(body["username"], "ada");
            Json(serde_json::json!({"status": "ok", "data": {"token": "from-login"}}))
        }),
    );
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(http, app).await.unwrap();
    });

    let mut config = config_for(ws_addr);
    config.server.url = format!("http://{http_addr}");
    config.server.token = None;
    config.server.token_env = "DESKLINK_TEST_UNSET_TOKEN".into();
    config.server.username = "ada".into();
    config.server.password = "pw".into();
    let client = DesktopClientBuilder::new(config).build().unwrap();
    let (handle, shutdown) = spawn(client);

    let conn = next_conn(&mut conns).await;
    assert!(conn.uri.contains("token=from-login"), "uri: {}", conn.uri);
    wait_for_state(&handle, ConnectionState::Connected).await;

    shutdown.cancel();
}
