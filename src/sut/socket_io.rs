//! Socket.IO v4 client over a raw WebSocket.
//!
//! Only the subset the load test needs: Engine.IO protocol 4 on the
//! `websocket` transport, the default namespace, text events, heartbeats and
//! the auth payload on connect. No polling, no reconnection, no binary
//! events.

use super::{
    reasons, AuthSession, ChannelCommand, ChannelConnector, ChannelEndpoint, EventChannel,
    InboundEvent, OutboundEvent,
};
use crate::error::ChannelError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CHANNEL_CAPACITY: usize = 256;

/// Engine.IO handshake data sent by the server in the open packet.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    #[serde(default)]
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl OpenInfo {
    /// How long the connection may stay silent before it counts as a ping timeout.
    pub fn heartbeat_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// A decoded Engine.IO / Socket.IO text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    Connect,
    ConnectError(String),
    Disconnect,
    Event(String, Value),
    Other(String),
}

/// Decode one text frame.
pub fn parse_packet(text: &str) -> Packet {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => serde_json::from_str(chars.as_str())
            .map(Packet::Open)
            .unwrap_or_else(|_| Packet::Other(text.to_string())),
        Some('1') => Packet::Close,
        Some('2') => Packet::Ping,
        Some('3') => Packet::Pong,
        Some('6') => Packet::Noop,
        Some('4') => parse_socket_packet(chars.as_str()),
        _ => Packet::Other(text.to_string()),
    }
}

fn parse_socket_packet(body: &str) -> Packet {
    let mut chars = body.chars();
    let kind = chars.next();
    let rest = chars.as_str();
    match kind {
        Some('0') => Packet::Connect,
        Some('1') => Packet::Disconnect,
        Some('4') => {
            let payload: Value = serde_json::from_str(rest).unwrap_or(Value::Null);
            Packet::ConnectError(super::describe(&payload))
        }
        Some('2') => {
            // Optional ack id precedes the JSON array.
            let json_start = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            match serde_json::from_str::<Value>(json_start) {
                Ok(Value::Array(mut items)) if !items.is_empty() => {
                    let payload = if items.len() > 1 {
                        items.swap_remove(1)
                    } else {
                        Value::Null
                    };
                    match items.first().and_then(Value::as_str) {
                        Some(name) => Packet::Event(name.to_string(), payload),
                        None => Packet::Other(body.to_string()),
                    }
                }
                _ => Packet::Other(body.to_string()),
            }
        }
        _ => Packet::Other(body.to_string()),
    }
}

/// Encode an outbound event as a Socket.IO EVENT frame.
pub fn encode_event(event: &OutboundEvent) -> String {
    format!("42{}", json!([event.name(), event.payload()]))
}

/// Build the WebSocket endpoint from a base URL such as `http://host:5002`.
pub fn websocket_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/socket.io/?EIO=4&transport=websocket", ws_base)
}

/// Opens Socket.IO channels against one server.
pub struct SocketIoConnector {
    endpoint: String,
    connect_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Self {
        Self {
            endpoint: websocket_endpoint(base_url),
            connect_timeout,
        }
    }

    async fn handshake(&self, session: &AuthSession) -> Result<EventChannel, ChannelError> {
        let (mut ws, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let open = loop {
            match next_packet(&mut ws).await? {
                Packet::Open(info) => break info,
                other => trace!("Ignoring pre-open packet {:?}", other),
            }
        };

        let auth = json!({ "token": session.token, "sessionId": session.session_id });
        send_text(&mut ws, format!("40{}", auth)).await?;

        loop {
            match next_packet(&mut ws).await? {
                Packet::Connect => break,
                Packet::ConnectError(message) => return Err(ChannelError::Rejected(message)),
                Packet::Ping => send_text(&mut ws, "3".to_string()).await?,
                Packet::Close => {
                    return Err(ChannelError::Transport(
                        "server closed during handshake".into(),
                    ))
                }
                other => trace!("Ignoring packet during connect: {:?}", other),
            }
        }

        debug!("Socket.IO session {} established", open.sid);
        let (channel, endpoint) = EventChannel::pair(CHANNEL_CAPACITY);
        tokio::spawn(drive(ws, endpoint, open.heartbeat_window()));
        Ok(channel)
    }
}

#[async_trait]
impl ChannelConnector for SocketIoConnector {
    async fn connect(&self, session: &AuthSession) -> Result<EventChannel, ChannelError> {
        timeout(self.connect_timeout, self.handshake(session))
            .await
            .map_err(|_| ChannelError::Timeout)?
    }

    fn name(&self) -> &'static str {
        "Socket.IO"
    }
}

async fn send_text(ws: &mut WsStream, text: String) -> Result<(), ChannelError> {
    ws.send(Message::Text(text))
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))
}

/// Write one frame, giving up once the heartbeat deadline passes: a peer
/// that stops reading stalls the sink.
async fn write_frame<S>(sink: &mut S, text: String, deadline: Instant) -> Result<(), &'static str>
where
    S: Sink<Message> + Unpin,
{
    match timeout_at(deadline, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(reasons::TRANSPORT_ERROR),
        Err(_) => Err(reasons::PING_TIMEOUT),
    }
}

async fn next_packet(ws: &mut WsStream) -> Result<Packet, ChannelError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(parse_packet(&text)),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ChannelError::Transport(
                    "connection closed during handshake".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
        }
    }
}

/// Own the socket: forward agent commands out, decode frames in, answer
/// heartbeats, and report exactly one `Disconnect` when the session ends.
async fn drive(ws: WsStream, endpoint: ChannelEndpoint, heartbeat_window: Duration) {
    let (mut sink, mut stream) = ws.split();
    let ChannelEndpoint {
        mut commands,
        events,
    } = endpoint;
    let mut heartbeat_deadline = Instant::now() + heartbeat_window;

    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ChannelCommand::Emit(event)) => {
                    let frame = encode_event(&event);
                    let sent = write_frame(&mut sink, frame, heartbeat_deadline).await;
                    if let Err(reason) = sent {
                        break reason;
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    let _ = write_frame(&mut sink, "41".to_string(), heartbeat_deadline).await;
                    let _ = timeout_at(heartbeat_deadline, sink.close()).await;
                    break reasons::CLIENT;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_packet(&text) {
                    Packet::Ping => {
                        heartbeat_deadline = Instant::now() + heartbeat_window;
                        let pong = "3".to_string();
                        let sent = write_frame(&mut sink, pong, heartbeat_deadline).await;
                        if let Err(reason) = sent {
                            break reason;
                        }
                    }
                    Packet::Event(name, payload) => {
                        if events.send(InboundEvent::from_wire(&name, &payload)).is_err() {
                            let _ = timeout_at(heartbeat_deadline, sink.close()).await;
                            break reasons::CLIENT;
                        }
                    }
                    Packet::Disconnect => break reasons::SERVER,
                    Packet::Close => break reasons::TRANSPORT_CLOSE,
                    other => trace!("Ignoring packet {:?}", other),
                },
                Some(Ok(Message::Close(_))) | None => break reasons::TRANSPORT_CLOSE,
                Some(Ok(_)) => {}
                Some(Err(_)) => break reasons::TRANSPORT_ERROR,
            },
            _ = sleep_until(heartbeat_deadline) => break reasons::PING_TIMEOUT,
        }
    };

    let _ = events.send(InboundEvent::Disconnect(reason.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sut::RoomId;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_parse_engine_packets() {
        assert_eq!(parse_packet("2"), Packet::Ping);
        assert_eq!(parse_packet("3"), Packet::Pong);
        assert_eq!(parse_packet("1"), Packet::Close);
        assert_eq!(parse_packet("40"), Packet::Connect);
        assert_eq!(parse_packet(r#"40{"sid":"abc"}"#), Packet::Connect);
        assert_eq!(parse_packet("41"), Packet::Disconnect);

        match parse_packet(r#"0{"sid":"s1","pingInterval":1000,"pingTimeout":500}"#) {
            Packet::Open(info) => {
                assert_eq!(info.sid, "s1");
                assert_eq!(info.heartbeat_window(), Duration::from_millis(1500));
            }
            other => panic!("expected open packet, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_event_and_connect_error() {
        assert_eq!(
            parse_packet(r#"42["message",{"_id":"m1"}]"#),
            Packet::Event("message".into(), json!({ "_id": "m1" }))
        );
        assert_eq!(
            parse_packet(r#"4217["joinRoomSuccess"]"#),
            Packet::Event("joinRoomSuccess".into(), Value::Null)
        );
        assert_eq!(
            parse_packet(r#"44{"message":"Invalid session"}"#),
            Packet::ConnectError("Invalid session".into())
        );
    }

    #[test]
    fn test_encode_event() {
        let frame = encode_event(&OutboundEvent::JoinRoom {
            room_id: RoomId::from("r1"),
        });
        assert_eq!(frame, r#"42["joinRoom","r1"]"#);
    }

    #[test]
    fn test_websocket_endpoint() {
        assert_eq!(
            websocket_endpoint("http://localhost:5002"),
            "ws://localhost:5002/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            websocket_endpoint("https://chat.example.com/"),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );
    }

    /// Minimal Socket.IO server: handshake, push one message, wait for the
    /// client's joinRoom, then disconnect the client from the server side.
    #[tokio::test]
    async fn test_session_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"s1","pingInterval":25000,"pingTimeout":20000}"#.into(),
            ))
            .await
            .unwrap();

            let auth = loop {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    break text;
                }
            };
            assert!(auth.starts_with("40"));
            assert!(auth.contains("\"token\":\"tok\""));

            ws.send(Message::Text(r#"40{"sid":"x"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(r#"42["message",{"_id":"m1"}]"#.into()))
                .await
                .unwrap();

            let join = loop {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    break text;
                }
            };
            ws.send(Message::Text("41".into())).await.unwrap();
            join
        });

        let connector = SocketIoConnector::new(&format!("http://{}", addr), Duration::from_secs(5));
        let session = AuthSession {
            token: "tok".into(),
            session_id: "sess".into(),
            user_name: "u".into(),
        };
        let mut channel = connector.connect(&session).await.unwrap();

        assert_eq!(
            channel.recv().await,
            InboundEvent::Message {
                id: Some("m1".into())
            }
        );
        channel
            .emit(OutboundEvent::JoinRoom {
                room_id: RoomId::from("r1"),
            })
            .await
            .unwrap();
        assert_eq!(
            channel.recv().await,
            InboundEvent::Disconnect(reasons::SERVER.to_string())
        );

        assert_eq!(server.await.unwrap(), r#"42["joinRoom","r1"]"#);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = SocketIoConnector::new(&format!("http://{}", addr), Duration::from_secs(2));
        let session = AuthSession {
            token: "tok".into(),
            session_id: "sess".into(),
            user_name: "u".into(),
        };
        assert!(connector.connect(&session).await.is_err());
    }
}
