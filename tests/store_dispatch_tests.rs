use std::sync::{Arc, Mutex};

use serde_json::json;

use dexsync::gateway::types::{Channel, Event, EventKind};
use dexsync::store::sequence::Sequence;
use dexsync::store::types::{DomainKey, SnapshotRequest, StateChange};
use dexsync::store::{Store, StoreConfig};

fn event(
    id: &str,
    kind: EventKind,
    source: Channel,
    seq: u64,
    payload: serde_json::Value,
) -> Event {
    Event {
        event_id: id.to_string(),
        kind,
        sequence: Sequence::from_u64(seq),
        timestamp: "1700000000000000000".to_string(),
        source,
        payload,
        metadata: None,
    }
}

fn book_snapshot(seq: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> Event {
    let levels = |side: &[(&str, &str)]| {
        side.iter().map(|(p, q)| json!([p, q])).collect::<Vec<_>>()
    };
    event(
        &format!("snap-{seq}"),
        EventKind::Snapshot,
        Channel::MarketData,
        seq,
        json!({"symbol": "BTC_USD", "bids": levels(bids), "asks": levels(asks)}),
    )
}

fn book_delta(seq: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> Event {
    let levels = |side: &[(&str, &str)]| {
        side.iter().map(|(p, q)| json!([p, q])).collect::<Vec<_>>()
    };
    event(
        &format!("delta-{seq}"),
        EventKind::Delta,
        Channel::MarketData,
        seq,
        json!({"symbol": "BTC_USD", "bids": levels(bids), "asks": levels(asks)}),
    )
}

fn btc_key() -> DomainKey {
    DomainKey::market(Channel::MarketData, "BTC_USD")
}

fn record_requests(store: &Store) -> Arc<Mutex<Vec<SnapshotRequest>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    store.on_request_snapshot(move |request| sink.lock().unwrap().push(request.clone()));
    log
}

#[test]
fn in_order_delta_flow() {
    let store = Store::default();
    let requests = record_requests(&store);

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]));
    store.dispatch(book_delta(101, &[("99.5", "2")], &[]));

    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(101));
    assert_eq!(store.buffered(&btc_key()), 0);
    let metrics = store.metrics();
    assert_eq!(metrics.events_applied, 2);
    assert_eq!(metrics.events_ignored, 0);
    assert_eq!(metrics.gaps_detected, 0);
    assert!(requests.lock().unwrap().is_empty());

    let book = store.orderbook("BTC_USD").unwrap();
    assert_eq!(book.bids.len(), 2);
    assert_eq!(book.best_bid().unwrap()[0], "100.0");
    book.validate_consistency().unwrap();
}

#[test]
fn pre_snapshot_buffering() {
    let store = Store::default();
    let requests = record_requests(&store);

    // The delta outruns the initial snapshot: no gap is counted, the delta
    // waits in the buffer, and a fresh-snapshot request goes out.
    store.dispatch(book_delta(101, &[("99.5", "2")], &[]));
    assert_eq!(store.last_seq(&btc_key()), Sequence::zero());
    assert_eq!(store.buffered(&btc_key()), 1);
    assert_eq!(store.metrics().gaps_detected, 0);
    {
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].since_seq, Sequence::zero());
    }

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]));

    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(101));
    assert_eq!(store.buffered(&btc_key()), 0);
    let book = store.orderbook("BTC_USD").unwrap();
    assert!(book.bids.iter().any(|level| level[0] == "99.5"));
}

#[test]
fn mid_stream_gap_triggers_recovery_request() {
    let store = Store::default();
    let requests = record_requests(&store);

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]));
    store.dispatch(book_delta(102, &[("99.0", "3")], &[]));

    assert_eq!(store.metrics().gaps_detected, 1);
    assert_eq!(store.buffered(&btc_key()), 1);
    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(100));
    {
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].channel, Channel::MarketData);
        assert_eq!(requests[0].params.get("symbol").unwrap(), "BTC_USD");
        assert_eq!(requests[0].since_seq, Sequence::from_u64(100));
    }

    // The missing delta arrives; the buffered one flushes behind it.
    store.dispatch(book_delta(101, &[("99.5", "2")], &[]));
    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(102));
    assert_eq!(store.buffered(&btc_key()), 0);
}

#[test]
fn duplicate_suppression() {
    let store = Store::default();

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]));
    store.dispatch(book_delta(101, &[("99.5", "2")], &[]));
    let before = store.orderbook("BTC_USD").unwrap();

    // Same event id again, then a second event behind the cursor.
    store.dispatch(book_delta(101, &[("99.5", "2")], &[]));
    store.dispatch(event(
        "stale-100",
        EventKind::Delta,
        Channel::MarketData,
        100,
        json!({"symbol": "BTC_USD", "bids": [["1", "1"]]}),
    ));

    let metrics = store.metrics();
    assert_eq!(metrics.events_ignored, 2);
    let after = store.orderbook("BTC_USD").unwrap();
    assert_eq!(before.bids, after.bids);
    assert_eq!(before.asks, after.asks);
    assert_eq!(after.last_seq, Sequence::from_u64(101));
}

#[test]
fn buffer_overflow_forces_full_resync() {
    let store = Store::default();
    let requests = record_requests(&store);

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]));

    // 10,001 deltas starting far ahead of the cursor, leaving the gap at
    // 101 unfilled. The final one tips the buffer over the cap.
    for seq in 1_000..11_001u64 {
        store.dispatch(book_delta(seq, &[("99.0", "1")], &[]));
    }

    assert_eq!(store.buffered(&btc_key()), 0);
    let metrics = store.metrics();
    assert_eq!(metrics.buffer_overflows, 1);
    assert_eq!(metrics.gaps_detected, 10_001);
    let requests = requests.lock().unwrap();
    assert_eq!(requests.last().unwrap().since_seq, Sequence::zero());
    // Projections kept their last consistent value.
    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(100));
}

#[test]
fn buffer_never_exceeds_cap() {
    let cfg = StoreConfig {
        delta_buffer_cap: 16,
        ..StoreConfig::default()
    };
    let store = Store::new(cfg);

    store.dispatch(book_snapshot(1, &[("100.0", "1")], &[]));
    for seq in 50..100u64 {
        store.dispatch(book_delta(seq, &[("99.0", "1")], &[]));
        assert!(store.buffered(&btc_key()) <= 16);
    }
}

#[test]
fn snapshot_flush_discards_stale_buffered_deltas() {
    let store = Store::default();

    // Buffered ahead of any snapshot: 98, 99, and 101.
    for seq in [98, 99, 101u64] {
        store.dispatch(book_delta(seq, &[("99.0", "1")], &[]));
    }
    assert_eq!(store.buffered(&btc_key()), 3);

    // The snapshot at 100 covers 98 and 99; only 101 still applies.
    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]));
    assert_eq!(store.buffered(&btc_key()), 0);
    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(101));
}

#[test]
fn repeated_snapshot_counts_ignored_once() {
    let store = Store::default();

    let snapshot = book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]);
    store.dispatch(snapshot.clone());
    let before = store.orderbook("BTC_USD").unwrap();
    store.dispatch(snapshot);

    let metrics = store.metrics();
    assert_eq!(metrics.events_applied, 1);
    assert_eq!(metrics.events_ignored, 1);
    let after = store.orderbook("BTC_USD").unwrap();
    assert_eq!(before.bids, after.bids);
    assert_eq!(before.last_seq, after.last_seq);
}

#[test]
fn replay_batch_matches_continuous_stream() {
    // Store A sees the stream live and in order.
    let live = Store::default();
    // Store B loses 101-102 and recovers them from a replay batch after 103.
    let recovered = Store::default();

    let snapshot = book_snapshot(100, &[("100.0", "5")], &[("100.5", "5")]);
    let deltas: Vec<Event> = vec![
        book_delta(101, &[("99.5", "1")], &[]),
        book_delta(102, &[("100.0", "0")], &[("101.0", "2")]),
        book_delta(103, &[("99.0", "4")], &[("100.5", "0")]),
    ];

    live.dispatch(snapshot.clone());
    for delta in &deltas {
        live.dispatch(delta.clone());
    }

    recovered.dispatch(snapshot);
    recovered.dispatch(deltas[2].clone()); // arrives first, gap detected
    recovered.dispatch(deltas[0].clone()); // replay batch, in order
    recovered.dispatch(deltas[1].clone());

    let a = live.orderbook("BTC_USD").unwrap();
    let b = recovered.orderbook("BTC_USD").unwrap();
    assert_eq!(a.bids, b.bids);
    assert_eq!(a.asks, b.asks);
    assert_eq!(a.last_seq, b.last_seq);
    a.validate_consistency().unwrap();
}

#[test]
fn ticker_shares_the_market_data_stream_cursor() {
    let store = Store::default();

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[("100.5", "1")]));
    store.dispatch(event(
        "tick-101",
        EventKind::Delta,
        Channel::MarketData,
        101,
        json!({"symbol": "BTC_USD", "last_price": "100.2", "volume_24h": "3210.5"}),
    ));
    store.dispatch(event(
        "tick-102",
        EventKind::Delta,
        Channel::MarketData,
        102,
        json!({"symbol": "BTC_USD", "high_24h": "101.0"}),
    ));

    let ticker = store.ticker("BTC_USD").unwrap();
    assert_eq!(ticker.last_price, "100.2");
    assert_eq!(ticker.volume_24h, "3210.5");
    assert_eq!(ticker.high_24h, "101.0");
    assert_eq!(ticker.low_24h, "0");
    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(102));
    // The book was not disturbed by ticker traffic.
    assert_eq!(store.orderbook("BTC_USD").unwrap().bids.len(), 1);
}

#[test]
fn trade_tape_appends_and_evicts() {
    let cfg = StoreConfig {
        trade_tape_cap: 3,
        ..StoreConfig::default()
    };
    let store = Store::new(cfg);

    for seq in 1..=5u64 {
        store.dispatch(event(
            &format!("trade-{seq}"),
            EventKind::Delta,
            Channel::Trades,
            seq,
            json!({
                "symbol": "BTC_USD",
                "trade_id": format!("t{seq}"),
                "price": "100.1",
                "quantity": "0.5",
                "side": if seq % 2 == 0 { "buy" } else { "sell" },
            }),
        ));
    }

    let tape = store.trades("BTC_USD");
    assert_eq!(tape.len(), 3);
    assert_eq!(tape[0].trade_id, "t3");
    assert_eq!(tape[2].trade_id, "t5");
}

#[test]
fn trades_snapshot_replaces_the_tape() {
    let store = Store::default();

    store.dispatch(event(
        "trade-1",
        EventKind::Delta,
        Channel::Trades,
        1,
        json!({"symbol": "BTC_USD", "price": "99.0", "quantity": "1", "side": "buy"}),
    ));
    store.dispatch(event(
        "tape-10",
        EventKind::Snapshot,
        Channel::Trades,
        10,
        json!({"symbol": "BTC_USD", "trades": [
            {"trade_id": "t8", "symbol": "BTC_USD", "price": "100.0", "quantity": "2", "side": "sell"},
            {"trade_id": "t9", "symbol": "BTC_USD", "price": "100.1", "quantity": "1", "side": "buy"},
        ]}),
    ));

    let tape = store.trades("BTC_USD");
    assert_eq!(tape.len(), 2);
    assert_eq!(tape[0].trade_id, "t8");
    assert_eq!(
        store.last_seq(&DomainKey::market(Channel::Trades, "BTC_USD")),
        Sequence::from_u64(10)
    );
}

#[test]
fn account_stream_uses_a_single_domain_key() {
    let store = Store::default();

    store.dispatch(event(
        "acct-1",
        EventKind::Snapshot,
        Channel::Account,
        1,
        json!({
            "account_id": "acct-42",
            "balances": {"BTC": "1.5", "USD": "100"},
            "orders": [
                {"order_id": "o1", "symbol": "BTC_USD", "side": "buy", "price": "99", "quantity": "1"},
            ],
        }),
    ));
    store.dispatch(event(
        "acct-2",
        EventKind::Delta,
        Channel::Account,
        2,
        json!({
            "balances": {"USD": "50"},
            "order": {"order_id": "o1", "symbol": "BTC_USD", "side": "buy", "price": "99", "quantity": "1", "status": "filled"},
        }),
    ));

    let account = store.account().unwrap();
    assert_eq!(account.account_id, "acct-42");
    assert_eq!(account.balances.get("BTC").unwrap(), "1.5");
    assert_eq!(account.balances.get("USD").unwrap(), "50");
    assert_eq!(account.orders.len(), 1);
    assert_eq!(store.last_seq(&DomainKey::account()), Sequence::from_u64(2));
}

#[test]
fn events_without_stream_identity_are_dropped() {
    let store = Store::default();
    let requests = record_requests(&store);

    store.dispatch(event(
        "no-symbol",
        EventKind::Delta,
        Channel::MarketData,
        1,
        json!({"bids": [["100", "1"]]}),
    ));

    let metrics = store.metrics();
    assert_eq!(metrics.events_dropped, 1);
    assert_eq!(metrics.events_applied, 0);
    assert!(requests.lock().unwrap().is_empty());
    assert!(store.orderbook("BTC_USD").is_none());
}

#[test]
fn malformed_payload_does_not_advance_the_cursor() {
    let store = Store::default();

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[]));
    store.dispatch(event(
        "bad-101",
        EventKind::Delta,
        Channel::MarketData,
        101,
        json!({"symbol": "BTC_USD", "bids": [["not-a-price", "1"]]}),
    ));

    let metrics = store.metrics();
    assert_eq!(metrics.events_dropped, 1);
    assert_eq!(store.last_seq(&btc_key()), Sequence::from_u64(100));
}

#[test]
fn state_change_listeners_fire_after_commit() {
    let store = Store::default();
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    let handle = store.on_state_change(move |change| sink.lock().unwrap().push(change.clone()));

    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[]));
    assert_eq!(
        changes.lock().unwrap().as_slice(),
        &[StateChange::Orderbook {
            symbol: "BTC_USD".to_string()
        }]
    );

    // Duplicates commit nothing and notify nothing.
    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[]));
    assert_eq!(changes.lock().unwrap().len(), 1);

    store.remove_listener(handle);
    store.dispatch(book_delta(101, &[("99.0", "1")], &[]));
    assert_eq!(changes.lock().unwrap().len(), 1);
}

#[test]
fn reset_clears_every_projection() {
    let store = Store::default();
    store.dispatch(book_snapshot(100, &[("100.0", "1")], &[]));
    assert!(store.orderbook("BTC_USD").is_some());

    store.reset();
    assert!(store.orderbook("BTC_USD").is_none());
    assert_eq!(store.last_seq(&btc_key()), Sequence::zero());
    let snapshot = store.state();
    assert!(snapshot.orderbooks.is_empty());
    assert!(snapshot.account.is_none());
}
