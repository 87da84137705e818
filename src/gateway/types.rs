//! Gateway wire protocol: frames, the event envelope, and error types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::sequence::Sequence;

/// Parameters identifying one stream within a channel. A `BTreeMap` keeps the
/// pairs canonically sorted so subscription keys are deterministic.
pub type Params = BTreeMap<String, String>;

/// Named class of streams served by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    MarketData,
    Account,
    Trades,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::MarketData => "market_data",
            Channel::Account => "account",
            Channel::Trades => "trades",
        }
    }

    pub const ALL: [Channel; 3] = [Channel::MarketData, Channel::Account, Channel::Trades];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic identifier for a (channel, params) subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(channel: Channel, params: &Params) -> Self {
        let mut key = channel.as_str().to_string();
        for (i, (k, v)) in params.iter().enumerate() {
            key.push(if i == 0 { '?' } else { '&' });
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection lifecycle state of the gateway client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Reconnecting,
}

/// Client -> server request frames, discriminated by `action`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        channel: Channel,
        params: Params,
    },
    Unsubscribe {
        channel: Channel,
        params: Params,
    },
    SnapshotSince {
        channel: Channel,
        params: SnapshotSinceParams,
    },
}

/// Subscription params extended with the replay cursor. `last_seq` rides on
/// the wire as a plain integer per the protocol.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSinceParams {
    #[serde(flatten)]
    pub params: Params,
    pub last_seq: u64,
}

/// Client -> server control frames, discriminated by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    Pong,
}

/// Server -> client control frames, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        session_id: String,
    },
    Ping,
    Subscribed {
        channel: Channel,
        #[serde(default)]
        params: Params,
        #[serde(default)]
        snapshot_seq: Sequence,
    },
    Unsubscribed {
        channel: Channel,
        #[serde(default)]
        params: Params,
    },
    SnapshotSinceResponse {
        channel: Channel,
        from_seq: Sequence,
        to_seq: Sequence,
        events: Vec<Event>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes the gateway surfaces on `error` frames. Codes this client
/// does not know fold into `Unknown` rather than failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    RateLimitExceeded,
    InvalidChannel,
    AuthFailed,
    InvalidAction,
    SeqTooOld,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InvalidChannel => "INVALID_CHANNEL",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidAction => "INVALID_ACTION",
            ErrorCode::SeqTooOld => "SEQ_TOO_OLD",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    fn from_wire(code: &str) -> Self {
        match code {
            "RATE_LIMIT_EXCEEDED" => ErrorCode::RateLimitExceeded,
            "INVALID_CHANNEL" => ErrorCode::InvalidChannel,
            "AUTH_FAILED" => ErrorCode::AuthFailed,
            "INVALID_ACTION" => ErrorCode::InvalidAction,
            "SEQ_TOO_OLD" => ErrorCode::SeqTooOld,
            _ => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(ErrorCode::from_wire(&code))
    }
}

/// Kind of a data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Snapshot,
    Delta,
}

/// The base-event envelope every non-control frame carries.
///
/// The envelope form with `event_type` is canonical; frames framed with a
/// top-level `type: "snapshot" | "delta"` are coerced through the serde
/// alias during parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    #[serde(rename = "event_type", alias = "type")]
    pub kind: EventKind,
    pub sequence: Sequence,
    /// Nanosecond timestamp, kept as the exact decimal string it arrived as.
    pub timestamp: String,
    pub source: Channel,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Event {
    /// Symbol carried by the payload, when the source channel keys streams
    /// by symbol.
    pub fn symbol(&self) -> Option<&str> {
        self.payload.get("symbol").and_then(serde_json::Value::as_str)
    }

    /// Stream parameters this event belongs to, mirroring the subscription
    /// that produced it. `None` when the payload lacks the symbol a
    /// symbol-keyed channel requires.
    pub fn stream_params(&self) -> Option<Params> {
        match self.source {
            Channel::Account => Some(Params::new()),
            Channel::MarketData | Channel::Trades => {
                let symbol = self.symbol()?;
                let mut params = Params::new();
                params.insert("symbol".to_string(), symbol.to_string());
                Some(params)
            }
        }
    }
}

/// A frame received from the gateway, after discrimination.
#[derive(Debug, Clone)]
pub enum Incoming {
    Control(ServerFrame),
    Event(Event),
}

/// Discriminate a raw text frame.
///
/// Control frames carry a known `type`; anything carrying `event_id` and
/// `sequence` is a data event. Everything else is malformed and must be
/// dropped without disturbing the connection.
pub fn parse_frame(text: &str) -> Result<Incoming, serde_json::Error> {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => Ok(Incoming::Control(frame)),
        Err(_) => serde_json::from_str::<Event>(text).map(Incoming::Event),
    }
}

/// One price level: `[price, quantity]`, both exact decimal strings.
pub type Level = [String; 2];

/// Orderbook payload for `market_data` snapshots and deltas. In a delta an
/// absent side means "no changes on that side".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookPayload {
    pub symbol: String,
    #[serde(default)]
    pub bids: Option<Vec<Level>>,
    #[serde(default)]
    pub asks: Option<Vec<Level>>,
}

/// Ticker payload for `market_data` deltas; absent fields retain their
/// previous value. The canonical volume field is `volume_24h`; the legacy
/// spelling is accepted as an alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerPayload {
    pub symbol: String,
    #[serde(default)]
    pub last_price: Option<String>,
    #[serde(default, alias = "24h_volume")]
    pub volume_24h: Option<String>,
    #[serde(default)]
    pub high_24h: Option<String>,
    #[serde(default)]
    pub low_24h: Option<String>,
    #[serde(default)]
    pub mark_price: Option<String>,
}

/// Taker side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// A single trade on the `trades` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePayload {
    pub symbol: String,
    #[serde(default)]
    pub trade_id: Option<String>,
    pub price: String,
    pub quantity: String,
    pub side: Side,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Complete tape replacement carried by a `trades` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTapePayload {
    pub symbol: String,
    pub trades: Vec<TradePayload>,
}

/// Lifecycle state of an order as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// An order record within the account projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: String,
    pub quantity: String,
    #[serde(default)]
    pub filled_quantity: Option<String>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
}

/// Complete account replacement carried by an `account` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshotPayload {
    pub account_id: String,
    #[serde(default)]
    pub balances: BTreeMap<String, String>,
    #[serde(default)]
    pub orders: Vec<OrderRecord>,
}

/// Incremental account change: balance updates merged field-wise, plus an
/// optional order upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDeltaPayload {
    #[serde(default)]
    pub balances: BTreeMap<String, String>,
    #[serde(default)]
    pub order: Option<OrderRecord>,
}

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication token unavailable: {0}")]
    Token(String),
    #[error("invalid gateway url: {0}")]
    Url(#[from] url::ParseError),
    #[error("not connected")]
    NotConnected,
    #[error("gateway error {code}: {message}")]
    Gateway { code: ErrorCode, message: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of a caller-initiated subscribe.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("subscription rejected by gateway ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("subscription limit reached ({0} per connection)")]
    LimitReached(usize),
    #[error("connection closed before acknowledgement")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_key_is_order_independent() {
        let mut a = Params::new();
        a.insert("symbol".into(), "BTC_USD".into());
        a.insert("depth".into(), "20".into());

        let mut b = Params::new();
        b.insert("depth".into(), "20".into());
        b.insert("symbol".into(), "BTC_USD".into());

        assert_eq!(
            SubscriptionKey::new(Channel::MarketData, &a),
            SubscriptionKey::new(Channel::MarketData, &b)
        );
        assert_eq!(
            SubscriptionKey::new(Channel::MarketData, &a).as_str(),
            "market_data?depth=20&symbol=BTC_USD"
        );
    }

    #[test]
    fn control_frames_parse_by_type() {
        let frame = parse_frame(r#"{"type":"connected","session_id":"s-1"}"#).unwrap();
        assert!(matches!(
            frame,
            Incoming::Control(ServerFrame::Connected { .. })
        ));

        let frame = parse_frame(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, Incoming::Control(ServerFrame::Ping)));
    }

    #[test]
    fn event_frames_parse_by_envelope_fields() {
        let text = r#"{
            "event_id": "e-1",
            "event_type": "delta",
            "sequence": "101",
            "timestamp": "1700000000000000000",
            "source": "market_data",
            "payload": {"symbol": "BTC_USD", "bids": [["100.5", "2"]]}
        }"#;
        match parse_frame(text).unwrap() {
            Incoming::Event(event) => {
                assert_eq!(event.kind, EventKind::Delta);
                assert_eq!(event.sequence, Sequence::from_u64(101));
                assert_eq!(event.symbol(), Some("BTC_USD"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn protocol_type_field_coerces_to_event_type() {
        // Snapshot framed with a top-level `type` rather than the canonical
        // `event_type` envelope field.
        let text = r#"{
            "event_id": "e-2",
            "type": "snapshot",
            "sequence": "100",
            "timestamp": "1700000000000000000",
            "source": "market_data",
            "payload": {"symbol": "BTC_USD", "bids": [], "asks": []}
        }"#;
        match parse_frame(text).unwrap() {
            Incoming::Event(event) => assert_eq!(event.kind, EventKind::Snapshot),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_errors_not_panics() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"type":"connected"}"#).is_err());
        assert!(parse_frame(r#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn ticker_volume_alias_is_accepted() {
        let canonical: TickerPayload =
            serde_json::from_str(r#"{"symbol":"BTC_USD","volume_24h":"123.4"}"#).unwrap();
        let legacy: TickerPayload =
            serde_json::from_str(r#"{"symbol":"BTC_USD","24h_volume":"123.4"}"#).unwrap();
        assert_eq!(canonical.volume_24h.as_deref(), Some("123.4"));
        assert_eq!(legacy.volume_24h.as_deref(), Some("123.4"));
    }

    #[test]
    fn unknown_error_codes_fall_back() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"error","code":"BRAND_NEW","message":"x"}"#).unwrap();
        match frame {
            ServerFrame::Error { code, .. } => assert_eq!(code, ErrorCode::Unknown),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_since_params_flatten_last_seq() {
        let mut params = Params::new();
        params.insert("symbol".into(), "BTC_USD".into());
        let request = ClientRequest::SnapshotSince {
            channel: Channel::MarketData,
            params: SnapshotSinceParams {
                params,
                last_seq: 500,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "snapshot_since");
        assert_eq!(json["params"]["symbol"], "BTC_USD");
        assert_eq!(json["params"]["last_seq"], 500);
    }
}
