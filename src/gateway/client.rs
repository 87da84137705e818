//! Reconnecting, authenticated gateway client.
//!
//! Owns the socket exclusively. Subscribes to named channels, polices the
//! server heartbeat, tracks per-subscription sequence cursors, and closes
//! outage gaps by re-subscribing and issuing `snapshot_since` requests after
//! every reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::{TransportCounters, TransportMetrics};
use crate::store::sequence::Sequence;

use super::types::{
    Channel, ClientControl, ClientRequest, ConnectionState, ErrorCode, Event, Incoming, Params,
    ServerFrame, SnapshotSinceParams, SubscribeError, SubscriptionKey, TransportError, parse_frame,
};

pub type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Supplies the auth token passed on the handshake URL. Invoked freshly
/// before every connection attempt; the client never caches tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, TransportError>;
}

/// Fixed token, for tests and static deployments.
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, TransportError> {
        Ok(self.0.clone())
    }
}

/// Gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    /// Close the connection locally when no server ping arrives within this
    /// window (ping interval plus tolerance).
    pub heartbeat_timeout: Duration,
    /// Server-side cap, enforced locally as well.
    pub max_subscriptions: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "wss://gateway.example.com/ws".to_string(),
            heartbeat_timeout: Duration::from_secs(20),
            max_subscriptions: 50,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(16),
        }
    }
}

impl GatewayConfig {
    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.reconnect_initial,
            initial_interval: self.reconnect_initial,
            randomization_factor: 0.2,
            multiplier: 2.0,
            max_interval: self.reconnect_max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Saved state for one (channel, params) subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub channel: Channel,
    pub params: Params,
    /// Highest sequence observed on the stream or acknowledged by the
    /// server; replay cursor across reconnects.
    pub last_seq: Sequence,
    /// Acknowledged on the current connection.
    pub active: bool,
}

/// Build the handshake URL with the token as a query parameter.
pub(crate) fn handshake_url(base: &str, token: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

struct Shared {
    cfg: GatewayConfig,
    tokens: Arc<dyn TokenProvider>,
    status_tx: watch::Sender<ConnectionState>,
    subs: Mutex<HashMap<SubscriptionKey, SubscriptionEntry>>,
    pending: Mutex<HashMap<SubscriptionKey, Vec<oneshot::Sender<Result<(), SubscribeError>>>>>,
    event_handlers: Mutex<HashMap<Channel, Vec<EventHandler>>>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connect_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    intentional_close: AtomicBool,
    driver_active: AtomicBool,
    shutdown: Notify,
    backoff: Mutex<ExponentialBackoff>,
    counters: TransportCounters,
}

/// The gateway client. Cheap to share: all state lives behind one `Arc`.
pub struct GatewayClient {
    shared: Arc<Shared>,
}

impl GatewayClient {
    pub fn new(cfg: GatewayConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = cfg.new_backoff();
        Self {
            shared: Arc::new(Shared {
                cfg,
                tokens,
                status_tx,
                subs: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                event_handlers: Mutex::new(HashMap::new()),
                error_handlers: Mutex::new(Vec::new()),
                out_tx: Mutex::new(None),
                connect_waiters: Mutex::new(Vec::new()),
                intentional_close: AtomicBool::new(false),
                driver_active: AtomicBool::new(false),
                shutdown: Notify::new(),
                backoff: Mutex::new(backoff),
                counters: TransportCounters::default(),
            }),
        }
    }

    pub fn status(&self) -> ConnectionState {
        *self.shared.status_tx.borrow()
    }

    /// Watch connection state transitions.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status_tx.subscribe()
    }

    pub fn metrics(&self) -> TransportMetrics {
        self.shared.counters.snapshot()
    }

    /// Current subscription registry, cursors included.
    pub fn subscriptions(&self) -> Vec<SubscriptionEntry> {
        self.shared.subs.lock().values().cloned().collect()
    }

    /// Establish the connection and resolve once the server's `connected`
    /// frame has been observed.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.status() == ConnectionState::Authenticated {
            return Ok(());
        }
        self.shared.intentional_close.store(false, Ordering::SeqCst);

        let (wait_tx, wait_rx) = oneshot::channel();
        self.shared.connect_waiters.lock().push(wait_tx);

        if !self.shared.driver_active.swap(true, Ordering::SeqCst) {
            self.shared.set_status(ConnectionState::Connecting);
            let ws = match self.shared.open_socket().await {
                Ok(ws) => ws,
                Err(error) => {
                    self.shared.driver_active.store(false, Ordering::SeqCst);
                    self.shared.connect_waiters.lock().clear();
                    self.shared.set_status(ConnectionState::Disconnected);
                    return Err(error);
                }
            };
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move { shared.run(ws).await });
        } else if self.status() == ConnectionState::Authenticated {
            // A concurrent connect finished the handshake first.
            return Ok(());
        }

        wait_rx
            .await
            .map_err(|_| TransportError::Connection("connection closed during handshake".into()))
    }

    /// Mark the session closed, cancel any scheduled reconnect, and close
    /// the socket cleanly.
    pub fn disconnect(&self) {
        self.shared.intentional_close.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();

        for (_, waiters) in self.shared.pending.lock().drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SubscribeError::Cancelled));
            }
        }
        self.shared.connect_waiters.lock().clear();

        let _ = self.shared.send_raw(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        })));
        self.shared.set_status(ConnectionState::Disconnected);
    }

    /// Subscribe and await the server's acknowledgement. Idempotent: an
    /// already-active subscription resolves immediately.
    pub async fn subscribe(&self, channel: Channel, params: Params) -> Result<(), SubscribeError> {
        self.subscribe_inner(channel, params, false).await
    }

    /// Send a subscribe frame even when the subscription is already active,
    /// prompting the server for a fresh snapshot.
    pub async fn resubscribe(
        &self,
        channel: Channel,
        params: Params,
    ) -> Result<(), SubscribeError> {
        self.subscribe_inner(channel, params, true).await
    }

    async fn subscribe_inner(
        &self,
        channel: Channel,
        params: Params,
        force: bool,
    ) -> Result<(), SubscribeError> {
        let shared = &self.shared;
        let key = SubscriptionKey::new(channel, &params);
        {
            let mut subs = shared.subs.lock();
            if let Some(entry) = subs.get(&key) {
                if entry.active && !force {
                    return Ok(());
                }
            } else {
                if subs.len() >= shared.cfg.max_subscriptions {
                    return Err(SubscribeError::LimitReached(shared.cfg.max_subscriptions));
                }
                subs.insert(
                    key.clone(),
                    SubscriptionEntry {
                        channel,
                        params: params.clone(),
                        last_seq: Sequence::zero(),
                        active: false,
                    },
                );
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        shared.pending.lock().entry(key).or_default().push(ack_tx);
        shared.send_json(&ClientRequest::Subscribe { channel, params })?;
        ack_rx.await.map_err(|_| SubscribeError::Cancelled)?
    }

    /// Drop the subscription locally and tell the server; fire-and-forget.
    pub fn unsubscribe(&self, channel: Channel, params: Params) {
        let key = SubscriptionKey::new(channel, &params);
        self.shared.subs.lock().remove(&key);
        if let Err(error) = self
            .shared
            .send_json(&ClientRequest::Unsubscribe { channel, params })
        {
            debug!(%error, %key, "unsubscribe frame not sent");
        }
    }

    /// Ask the server to replay a stream from `since_seq`.
    pub fn request_snapshot_since(
        &self,
        channel: Channel,
        params: Params,
        since_seq: &Sequence,
    ) -> Result<(), TransportError> {
        self.shared.send_json(&ClientRequest::SnapshotSince {
            channel,
            params: SnapshotSinceParams {
                params,
                last_seq: since_seq.to_u64_saturating(),
            },
        })
    }

    /// Register an observer for data events on one channel.
    pub fn on_event(&self, channel: Channel, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.shared
            .event_handlers
            .lock()
            .entry(channel)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register an observer for transport-level errors.
    pub fn on_error(&self, handler: impl Fn(&TransportError) + Send + Sync + 'static) {
        self.shared.error_handlers.lock().push(Arc::new(handler));
    }
}

impl Shared {
    fn set_status(&self, status: ConnectionState) {
        self.status_tx.send_replace(status);
    }

    async fn open_socket(&self) -> Result<WebSocket, TransportError> {
        let token = self.tokens.token().await?;
        let url = handshake_url(&self.cfg.url, &token)?;
        debug!(url = %self.cfg.url, "opening gateway connection");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|error| TransportError::Connection(error.to_string()))?;
        Ok(ws)
    }

    /// Connection driver: runs one connection at a time, reconnecting with
    /// backoff after every unexpected close until told to stop.
    async fn run(self: Arc<Self>, mut ws: WebSocket) {
        self.counters.record_connect();
        loop {
            self.drive(ws).await;
            self.teardown_connection();

            if self.intentional_close.load(Ordering::SeqCst) {
                self.set_status(ConnectionState::Disconnected);
                break;
            }
            self.set_status(ConnectionState::Reconnecting);
            match self.reconnect().await {
                Some(next) => {
                    self.counters.record_reconnect();
                    ws = next;
                }
                None => {
                    self.set_status(ConnectionState::Disconnected);
                    break;
                }
            }
        }
        self.connect_waiters.lock().clear();
        self.driver_active.store(false, Ordering::SeqCst);
    }

    /// Sleep out the backoff schedule and redial until a socket opens or the
    /// client is closed.
    async fn reconnect(&self) -> Option<WebSocket> {
        loop {
            let delay = self
                .backoff
                .lock()
                .next_backoff()
                .unwrap_or(self.cfg.reconnect_max);
            debug!(?delay, "scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return None,
            }
            if self.intentional_close.load(Ordering::SeqCst) {
                return None;
            }
            self.set_status(ConnectionState::Connecting);
            match self.open_socket().await {
                Ok(ws) => return Some(ws),
                Err(error) => {
                    warn!(%error, "reconnect attempt failed");
                    self.set_status(ConnectionState::Reconnecting);
                }
            }
        }
    }

    /// Pump one connection until it closes: reads frames, writes queued
    /// messages, and enforces the heartbeat deadline.
    async fn drive(self: &Arc<Self>, ws: WebSocket) {
        let (mut sink, mut stream): (WsSink, WsStream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.out_tx.lock() = Some(out_tx);

        let mut deadline = Instant::now() + self.cfg.heartbeat_timeout;
        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.counters.record_frame();
                            if self.handle_text(&text) {
                                deadline = Instant::now() + self.cfg.heartbeat_timeout;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "gateway closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(%error, "websocket error");
                            break;
                        }
                        None => {
                            debug!("websocket stream ended");
                            break;
                        }
                    }
                }
                outgoing = out_rx.recv() => {
                    let Some(message) = outgoing else { break };
                    if let Err(error) = sink.send(message).await {
                        warn!(%error, "failed to send frame");
                        break;
                    }
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        timeout = ?self.cfg.heartbeat_timeout,
                        "no ping within the liveness window, closing connection"
                    );
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(4000),
                            reason: "heartbeat timeout".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }

    fn teardown_connection(&self) {
        *self.out_tx.lock() = None;
        for entry in self.subs.lock().values_mut() {
            entry.active = false;
        }
    }

    /// Handle one text frame. Returns true when the frame resets the
    /// heartbeat deadline.
    fn handle_text(self: &Arc<Self>, text: &str) -> bool {
        match parse_frame(text) {
            Ok(Incoming::Control(frame)) => self.handle_control(frame),
            Ok(Incoming::Event(event)) => {
                self.deliver_event(event);
                false
            }
            Err(error) => {
                self.counters.record_malformed();
                warn!(%error, "dropping malformed frame");
                false
            }
        }
    }

    fn handle_control(self: &Arc<Self>, frame: ServerFrame) -> bool {
        match frame {
            ServerFrame::Connected { session_id } => {
                info!(%session_id, "gateway session established");
                self.backoff.lock().reset();
                self.set_status(ConnectionState::Authenticated);
                for waiter in self.connect_waiters.lock().drain(..) {
                    let _ = waiter.send(());
                }
                self.resubscribe_all();
                false
            }
            ServerFrame::Ping => {
                if let Err(error) = self.send_json(&ClientControl::Pong) {
                    debug!(%error, "pong not sent");
                }
                true
            }
            ServerFrame::Subscribed {
                channel,
                params,
                snapshot_seq,
            } => {
                let key = SubscriptionKey::new(channel, &params);
                {
                    let mut subs = self.subs.lock();
                    let entry = subs.entry(key.clone()).or_insert_with(|| SubscriptionEntry {
                        channel,
                        params: params.clone(),
                        last_seq: Sequence::zero(),
                        active: false,
                    });
                    entry.active = true;
                    if entry.last_seq < snapshot_seq {
                        entry.last_seq = snapshot_seq;
                    }
                }
                if let Some(waiters) = self.pending.lock().remove(&key) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
                debug!(%key, "subscription acknowledged");
                false
            }
            ServerFrame::Unsubscribed { channel, params } => {
                debug!(key = %SubscriptionKey::new(channel, &params), "unsubscribed");
                false
            }
            ServerFrame::SnapshotSinceResponse {
                channel,
                from_seq,
                to_seq,
                events,
            } => {
                debug!(
                    %channel,
                    %from_seq,
                    %to_seq,
                    count = events.len(),
                    "replaying snapshot_since batch"
                );
                for event in events {
                    self.deliver_event(event);
                }
                false
            }
            ServerFrame::Error { code, message } => {
                self.handle_error_frame(code, message);
                false
            }
        }
    }

    fn handle_error_frame(&self, code: ErrorCode, message: String) {
        // No correlation id on the wire: any error other than a rate-limit
        // warning rejects the outstanding subscribe attempts. Rate limits
        // leave subscription state untouched.
        if code != ErrorCode::RateLimitExceeded {
            for (_, waiters) in self.pending.lock().drain() {
                for waiter in waiters {
                    let _ = waiter.send(Err(SubscribeError::Rejected {
                        code,
                        message: message.clone(),
                    }));
                }
            }
        }
        let error = TransportError::Gateway { code, message };
        let handlers: Vec<ErrorHandler> = self.error_handlers.lock().clone();
        for handler in &handlers {
            handler(&error);
        }
    }

    /// Forward a data event to the channel's observers, advancing the
    /// subscription cursor first. Replayed batch events take the same path
    /// as live ones.
    fn deliver_event(&self, event: Event) {
        if let Some(params) = event.stream_params() {
            let key = SubscriptionKey::new(event.source, &params);
            let mut subs = self.subs.lock();
            if let Some(entry) = subs.get_mut(&key) {
                if entry.last_seq < event.sequence {
                    entry.last_seq = event.sequence.clone();
                }
            }
        }
        let handlers: Vec<EventHandler> = self
            .event_handlers
            .lock()
            .get(&event.source)
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(&event);
        }
    }

    /// After authentication, restore every saved subscription and request
    /// replay of whatever each stream missed during the outage.
    fn resubscribe_all(&self) {
        let entries: Vec<SubscriptionEntry> = self.subs.lock().values().cloned().collect();
        if entries.is_empty() {
            return;
        }
        info!(count = entries.len(), "restoring subscriptions");
        for entry in entries {
            if let Err(error) = self.send_json(&ClientRequest::Subscribe {
                channel: entry.channel,
                params: entry.params.clone(),
            }) {
                warn!(%error, channel = %entry.channel, "re-subscribe frame not sent");
                continue;
            }
            if !entry.last_seq.is_zero() {
                if let Err(error) = self.send_json(&ClientRequest::SnapshotSince {
                    channel: entry.channel,
                    params: SnapshotSinceParams {
                        params: entry.params.clone(),
                        last_seq: entry.last_seq.to_u64_saturating(),
                    },
                }) {
                    warn!(%error, channel = %entry.channel, "snapshot_since frame not sent");
                }
            }
        }
    }

    fn send_raw(&self, message: Message) -> Result<(), TransportError> {
        match self.out_tx.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    fn send_json<T: Serialize>(&self, value: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(value)?;
        self.send_raw(Message::Text(text))
    }
}
