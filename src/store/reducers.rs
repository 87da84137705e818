//! Pure reducers: each takes the current projection and an event payload and
//! returns a new projection without mutating its input.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::gateway::types::{
    AccountDeltaPayload, AccountSnapshotPayload, BookPayload, Level, TickerPayload, TradePayload,
    TradeTapePayload,
};
use crate::store::sequence::Sequence;
use crate::store::types::{Account, Orderbook, Ticker, Trade};

/// A payload field that cannot be reduced. The dispatcher drops the event.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error("unparseable price {0:?}")]
    InvalidPrice(String),
    #[error("unparseable quantity {0:?}")]
    InvalidQuantity(String),
}

fn parse_price(level: &Level) -> Result<Decimal, ReduceError> {
    Decimal::from_str(&level[0]).map_err(|_| ReduceError::InvalidPrice(level[0].clone()))
}

fn parse_quantity(level: &Level) -> Result<Decimal, ReduceError> {
    Decimal::from_str(&level[1]).map_err(|_| ReduceError::InvalidQuantity(level[1].clone()))
}

/// Apply per-price updates to one side. A zero quantity removes the level;
/// anything else replaces or inserts. Prices are unique by numeric value and
/// the returned side is re-emitted in its sort order.
fn apply_side(
    current: &[Level],
    updates: Option<&[Level]>,
    descending: bool,
) -> Result<Vec<Level>, ReduceError> {
    let Some(updates) = updates else {
        return Ok(current.to_vec());
    };

    let mut by_price: BTreeMap<Decimal, Level> = BTreeMap::new();
    for level in current {
        by_price.insert(parse_price(level)?, level.clone());
    }
    for update in updates {
        let price = parse_price(update)?;
        if parse_quantity(update)?.is_zero() {
            by_price.remove(&price);
        } else {
            by_price.insert(price, update.clone());
        }
    }

    let ordered = by_price.into_values();
    Ok(if descending {
        ordered.rev().collect()
    } else {
        ordered.collect()
    })
}

/// Replace the orderbook wholesale from a snapshot payload.
pub fn book_snapshot(payload: &BookPayload, seq: &Sequence) -> Result<Orderbook, ReduceError> {
    Ok(Orderbook {
        symbol: payload.symbol.clone(),
        bids: apply_side(&[], Some(payload.bids.as_deref().unwrap_or(&[])), true)?,
        asks: apply_side(&[], Some(payload.asks.as_deref().unwrap_or(&[])), false)?,
        last_seq: seq.clone(),
    })
}

/// Apply an incremental book update; sides absent from the payload are
/// untouched.
pub fn book_delta(
    prev: &Orderbook,
    payload: &BookPayload,
    seq: &Sequence,
) -> Result<Orderbook, ReduceError> {
    Ok(Orderbook {
        symbol: prev.symbol.clone(),
        bids: apply_side(&prev.bids, payload.bids.as_deref(), true)?,
        asks: apply_side(&prev.asks, payload.asks.as_deref(), false)?,
        last_seq: seq.clone(),
    })
}

/// Merge a ticker update over the previous value; fields missing from the
/// payload retain their prior value, and a first update starts from "0"s.
pub fn ticker_update(prev: Option<&Ticker>, payload: &TickerPayload, seq: &Sequence) -> Ticker {
    let mut next = prev
        .cloned()
        .unwrap_or_else(|| Ticker::empty(payload.symbol.clone()));
    if let Some(last_price) = &payload.last_price {
        next.last_price = last_price.clone();
    }
    if let Some(volume_24h) = &payload.volume_24h {
        next.volume_24h = volume_24h.clone();
    }
    if let Some(high_24h) = &payload.high_24h {
        next.high_24h = high_24h.clone();
    }
    if let Some(low_24h) = &payload.low_24h {
        next.low_24h = low_24h.clone();
    }
    if let Some(mark_price) = &payload.mark_price {
        next.mark_price = mark_price.clone();
    }
    next.last_seq = seq.clone();
    next
}

fn trade_record(payload: &TradePayload, fallback_id: &str, fallback_ts: &str) -> Trade {
    Trade {
        trade_id: payload
            .trade_id
            .clone()
            .unwrap_or_else(|| fallback_id.to_string()),
        symbol: payload.symbol.clone(),
        price: payload.price.clone(),
        quantity: payload.quantity.clone(),
        side: payload.side,
        timestamp: payload
            .timestamp
            .clone()
            .unwrap_or_else(|| fallback_ts.to_string()),
    }
}

/// Append a trade to the tape, evicting oldest-first past the cap.
pub fn trade_append(
    tape: &[Trade],
    payload: &TradePayload,
    event_id: &str,
    event_ts: &str,
    cap: usize,
) -> Vec<Trade> {
    let mut next = tape.to_vec();
    next.push(trade_record(payload, event_id, event_ts));
    if next.len() > cap {
        let excess = next.len() - cap;
        next.drain(..excess);
    }
    next
}

/// Replace the tape wholesale from a snapshot payload, keeping the newest
/// `cap` entries.
pub fn trade_tape_snapshot(
    payload: &TradeTapePayload,
    event_id: &str,
    event_ts: &str,
    cap: usize,
) -> Vec<Trade> {
    let mut next: Vec<Trade> = payload
        .trades
        .iter()
        .enumerate()
        .map(|(i, trade)| trade_record(trade, &format!("{event_id}:{i}"), event_ts))
        .collect();
    if next.len() > cap {
        let excess = next.len() - cap;
        next.drain(..excess);
    }
    next
}

/// Replace the account wholesale: balances as given, orders re-keyed by id.
pub fn account_snapshot(payload: &AccountSnapshotPayload, seq: &Sequence) -> Account {
    Account {
        account_id: payload.account_id.clone(),
        balances: payload.balances.clone(),
        orders: payload
            .orders
            .iter()
            .map(|order| (order.order_id.clone(), order.clone()))
            .collect(),
        last_seq: seq.clone(),
    }
}

/// Merge balance updates field-wise and upsert the order, if any.
pub fn account_delta(
    prev: Option<&Account>,
    payload: &AccountDeltaPayload,
    seq: &Sequence,
) -> Account {
    let mut next = prev.cloned().unwrap_or_else(|| Account::new(""));
    for (asset, balance) in &payload.balances {
        next.balances.insert(asset.clone(), balance.clone());
    }
    if let Some(order) = &payload.order {
        next.orders.insert(order.order_id.clone(), order.clone());
    }
    next.last_seq = seq.clone();
    next
}
