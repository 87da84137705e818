//! In-memory projections derived from the event streams.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::gateway::types::{Channel, Level, OrderRecord, Params, Side};
use crate::store::sequence::Sequence;

/// Identifier partitioning sequence tracking and delta buffers: one logical
/// stream per key (`channel::symbol`, or plain `account`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainKey(String);

impl DomainKey {
    pub fn market(channel: Channel, symbol: &str) -> Self {
        Self(format!("{channel}::{symbol}"))
    }

    pub fn account() -> Self {
        Self(Channel::Account.as_str().to_string())
    }

    /// The stream an event belongs to. `None` when a symbol-keyed channel
    /// carries a payload without a symbol.
    pub fn of(event: &crate::gateway::types::Event) -> Option<Self> {
        match event.source {
            Channel::Account => Some(Self::account()),
            Channel::MarketData | Channel::Trades => event
                .symbol()
                .map(|symbol| Self::market(event.source, symbol)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Orderbook for one symbol. Bids descend, asks ascend; levels hold the exact
/// decimal strings they arrived as, and no level carries a zero quantity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Orderbook {
    pub symbol: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub last_seq: Sequence,
}

impl Orderbook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            last_seq: Sequence::zero(),
        }
    }

    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }

    /// Check the server contract: unique prices per side, no zero
    /// quantities, best bid strictly below best ask.
    pub fn validate_consistency(&self) -> Result<(), String> {
        for (side, levels, descending) in
            [("bid", &self.bids, true), ("ask", &self.asks, false)]
        {
            let mut prev: Option<Decimal> = None;
            for level in levels {
                let price = Decimal::from_str(&level[0])
                    .map_err(|e| format!("unparseable {side} price {:?}: {e}", level[0]))?;
                let quantity = Decimal::from_str(&level[1])
                    .map_err(|e| format!("unparseable {side} quantity {:?}: {e}", level[1]))?;
                if quantity.is_zero() {
                    return Err(format!("zero-quantity {side} level at {}", level[0]));
                }
                if let Some(prev) = prev {
                    let ordered = if descending { price < prev } else { price > prev };
                    if !ordered {
                        return Err(format!("{side} levels out of order at {}", level[0]));
                    }
                }
                prev = Some(price);
            }
        }

        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            let bid = Decimal::from_str(&bid[0]).map_err(|e| e.to_string())?;
            let ask = Decimal::from_str(&ask[0]).map_err(|e| e.to_string())?;
            if bid >= ask {
                return Err(format!("crossed book: best bid {bid} >= best ask {ask}"));
            }
        }
        Ok(())
    }
}

/// Rolling 24h ticker for one symbol. Values are exact decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: String,
    pub volume_24h: String,
    pub high_24h: String,
    pub low_24h: String,
    pub mark_price: String,
    pub last_seq: Sequence,
}

impl Ticker {
    /// An empty ticker with every field defaulted to "0".
    pub fn empty(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            last_price: "0".to_string(),
            volume_24h: "0".to_string(),
            high_24h: "0".to_string(),
            low_24h: "0".to_string(),
            mark_price: "0".to_string(),
            last_seq: Sequence::zero(),
        }
    }
}

/// One executed trade on the bounded per-symbol tape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub symbol: String,
    pub price: String,
    pub quantity: String,
    pub side: Side,
    pub timestamp: String,
}

/// The authenticated account: balances by asset and open orders by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub balances: BTreeMap<String, String>,
    pub orders: BTreeMap<String, OrderRecord>,
    pub last_seq: Sequence,
}

impl Account {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            balances: BTreeMap::new(),
            orders: BTreeMap::new(),
            last_seq: Sequence::zero(),
        }
    }
}

/// Which projection a committed mutation touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Orderbook { symbol: String },
    Ticker { symbol: String },
    Trades { symbol: String },
    Account,
}

/// Recovery request the store hands to the transport: replay the stream at
/// `(channel, params)` from `since_seq` (0 means resynchronise from a fresh
/// snapshot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub channel: Channel,
    pub params: Params,
    pub since_seq: Sequence,
}

/// Owned copy of every projection, for whole-state reads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateSnapshot {
    pub orderbooks: BTreeMap<String, Orderbook>,
    pub tickers: BTreeMap<String, Ticker>,
    pub trades: BTreeMap<String, Vec<Trade>>,
    pub account: Option<Account>,
}
