//! In-process mock gateway for tests and offline runs.
//!
//! Serves the real wire protocol over a loopback listener: handshake token
//! check, `connected` and `subscribed` control frames, scripted event
//! emission, and `snapshot_since` replay from a recorded event log.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use super::types::{Channel, Event};

#[derive(Debug, Clone, Default)]
pub struct MockGatewayConfig {
    /// Reject handshakes whose `token` query parameter differs. `None`
    /// accepts any token.
    pub expected_token: Option<String>,
    /// Emit `ping` control frames at this interval. `None` disables them.
    pub ping_interval: Option<Duration>,
    /// Answer every subscribe with an `error` frame carrying this code
    /// instead of an acknowledgement.
    pub subscribe_error: Option<String>,
}

struct MockState {
    cfg: MockGatewayConfig,
    /// Every event ever pushed, in order; the replay source.
    log: Mutex<Vec<Event>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
    received: Mutex<Vec<serde_json::Value>>,
    sessions: AtomicU64,
}

/// A loopback gateway server. Dropping it stops the listener.
pub struct MockGateway {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept_task: JoinHandle<()>,
}

impl MockGateway {
    pub async fn spawn(cfg: MockGatewayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(MockState {
            cfg,
            log: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            sessions: AtomicU64::new(0),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "mock gateway accepted connection");
                        tokio::spawn(handle_connection(Arc::clone(&accept_state), stream));
                    }
                    Err(error) => {
                        warn!(%error, "mock gateway accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Record an event in the replay log and push it to every connected
    /// client.
    pub fn push_event(&self, event: Event) {
        let text = serde_json::to_string(&event).expect("event serializes");
        self.state.log.lock().push(event);
        self.broadcast(Message::Text(text));
    }

    /// Record an event in the replay log without delivering it, as if the
    /// client missed it in transit. Only `snapshot_since` surfaces it.
    pub fn log_event(&self, event: Event) {
        self.state.log.lock().push(event);
    }

    /// Send a `ping` control frame to every connected client.
    pub fn ping_all(&self) {
        self.broadcast(Message::Text(r#"{"type":"ping"}"#.to_string()));
    }

    /// Send an `error` control frame to every connected client.
    pub fn error_all(&self, code: &str, message: &str) {
        let text = serde_json::json!({"type": "error", "code": code, "message": message});
        self.broadcast(Message::Text(text.to_string()));
    }

    /// Send a raw text frame to every connected client.
    pub fn send_raw_all(&self, text: impl Into<String>) {
        self.broadcast(Message::Text(text.into()));
    }

    /// Drop every live connection abruptly, as an outage would.
    pub fn drop_connections(&self) {
        self.state.clients.lock().clear();
    }

    /// Number of sessions the server has accepted so far.
    pub fn sessions(&self) -> u64 {
        self.state.sessions.load(Ordering::SeqCst)
    }

    /// Frames received from clients, oldest first.
    pub fn received_frames(&self) -> Vec<serde_json::Value> {
        self.state.received.lock().clone()
    }

    /// Received frames whose `action` matches.
    pub fn received_with_action(&self, action: &str) -> Vec<serde_json::Value> {
        self.received_frames()
            .into_iter()
            .filter(|frame| frame.get("action").and_then(|a| a.as_str()) == Some(action))
            .collect()
    }

    fn broadcast(&self, message: Message) {
        self.state
            .clients
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn token_of(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}

async fn handle_connection(state: Arc<MockState>, stream: TcpStream) {
    let expected = state.cfg.expected_token.clone();
    let callback = move |request: &Request, response: Response| {
        if let Some(expected) = &expected {
            if token_of(request).as_deref() != Some(expected.as_str()) {
                let mut reject = ErrorResponse::new(Some("invalid token".to_string()));
                *reject.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
                return Err(reject);
            }
        }
        Ok(response)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(error) => {
            debug!(%error, "mock gateway handshake rejected");
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    state.clients.lock().push(tx);
    let session = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;

    let connected =
        serde_json::json!({"type": "connected", "session_id": format!("session-{session}")});
    if sink.send(Message::Text(connected.to_string())).await.is_err() {
        return;
    }

    let ping_enabled = state.cfg.ping_interval.is_some();
    let mut ping_timer = tokio::time::interval(
        state
            .cfg
            .ping_interval
            .unwrap_or(Duration::from_secs(3600)),
    );

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        for reply in handle_request(&state, &text) {
                            if sink.send(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            outgoing = rx.recv() => {
                // Sender dropped: the test forced an outage.
                let Some(message) = outgoing else { break };
                if sink.send(message).await.is_err() {
                    return;
                }
            }
            _ = ping_timer.tick(), if ping_enabled => {
                if sink.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn handle_request(state: &MockState, text: &str) -> Vec<Message> {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
        return vec![error_frame("INVALID_ACTION", "malformed frame")];
    };
    state.received.lock().push(frame.clone());

    if frame.get("type").and_then(|t| t.as_str()) == Some("pong") {
        return Vec::new();
    }

    let action = frame.get("action").and_then(|a| a.as_str());
    let channel = frame.get("channel").cloned().unwrap_or(serde_json::Value::Null);
    let params = frame
        .get("params")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    match action {
        Some("subscribe") => {
            if let Some(code) = &state.cfg.subscribe_error {
                return vec![error_frame(code, "subscription refused")];
            }
            let snapshot_seq = last_seq_for(state, &channel, &params);
            let ack = serde_json::json!({
                "type": "subscribed",
                "channel": channel,
                "params": params,
                "snapshot_seq": snapshot_seq,
            });
            vec![Message::Text(ack.to_string())]
        }
        Some("unsubscribe") => {
            let ack = serde_json::json!({
                "type": "unsubscribed",
                "channel": channel,
                "params": params,
            });
            vec![Message::Text(ack.to_string())]
        }
        Some("snapshot_since") => {
            let last_seq = params.get("last_seq").and_then(|s| s.as_u64()).unwrap_or(0);
            let events: Vec<Event> = state
                .log
                .lock()
                .iter()
                .filter(|event| stream_matches(event, &channel, &params))
                .filter(|event| event.sequence.to_u64_saturating() > last_seq)
                .cloned()
                .collect();
            let to_seq = events
                .last()
                .map(|event| event.sequence.to_u64_saturating())
                .unwrap_or(last_seq);
            let response = serde_json::json!({
                "type": "snapshot_since_response",
                "channel": channel,
                "from_seq": last_seq,
                "to_seq": to_seq,
                "events": events,
            });
            vec![Message::Text(response.to_string())]
        }
        _ => vec![error_frame("INVALID_ACTION", "unsupported action")],
    }
}

fn stream_matches(event: &Event, channel: &serde_json::Value, params: &serde_json::Value) -> bool {
    let Some(channel) = channel.as_str() else {
        return false;
    };
    if event.source.as_str() != channel {
        return false;
    }
    if event.source == Channel::Account {
        return true;
    }
    match params.get("symbol").and_then(|s| s.as_str()) {
        Some(symbol) => event.symbol() == Some(symbol),
        None => true,
    }
}

fn error_frame(code: &str, message: &str) -> Message {
    let frame = serde_json::json!({"type": "error", "code": code, "message": message});
    Message::Text(frame.to_string())
}

fn last_seq_for(state: &MockState, channel: &serde_json::Value, params: &serde_json::Value) -> u64 {
    state
        .log
        .lock()
        .iter()
        .filter(|event| stream_matches(event, channel, params))
        .map(|event| event.sequence.to_u64_saturating())
        .max()
        .unwrap_or(0)
}
