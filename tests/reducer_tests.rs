use dexsync::gateway::types::{BookPayload, Level, Side, TickerPayload, TradePayload};
use dexsync::store::reducers;
use dexsync::store::sequence::Sequence;
use dexsync::store::types::Orderbook;

fn level(price: &str, quantity: &str) -> Level {
    [price.to_string(), quantity.to_string()]
}

fn seeded_book() -> Orderbook {
    let payload = BookPayload {
        symbol: "BTC_USD".into(),
        bids: Some(vec![level("100.0", "1.5"), level("99.5", "2")]),
        asks: Some(vec![level("100.5", "1"), level("101.0", "3")]),
    };
    reducers::book_snapshot(&payload, &Sequence::from_u64(100)).unwrap()
}

#[test]
fn reducers_are_referentially_transparent() {
    let book = seeded_book();
    let payload = BookPayload {
        symbol: "BTC_USD".into(),
        bids: Some(vec![level("99.5", "0"), level("98.0", "7")]),
        asks: None,
    };

    let once = reducers::book_delta(&book, &payload, &Sequence::from_u64(101)).unwrap();
    let twice = reducers::book_delta(&book, &payload, &Sequence::from_u64(101)).unwrap();
    assert_eq!(once.bids, twice.bids);
    assert_eq!(once.asks, twice.asks);

    // The input book is unchanged by both applications.
    assert_eq!(book.bids, seeded_book().bids);
    assert_eq!(book.asks, seeded_book().asks);
}

#[test]
fn book_levels_stay_unique_and_nonzero() {
    let book = seeded_book();
    let payload = BookPayload {
        symbol: "BTC_USD".into(),
        // Replace an existing price, remove another, insert a new one.
        bids: Some(vec![
            level("100.0", "9"),
            level("99.5", "0"),
            level("99.9", "1"),
        ]),
        asks: None,
    };
    let next = reducers::book_delta(&book, &payload, &Sequence::from_u64(101)).unwrap();

    assert_eq!(next.bids, vec![level("100.0", "9"), level("99.9", "1")]);
    next.validate_consistency().unwrap();
}

#[test]
fn numerically_equal_prices_collapse_to_one_level() {
    let book = seeded_book();
    // "100.00" is the same price level as the seeded "100.0".
    let payload = BookPayload {
        symbol: "BTC_USD".into(),
        bids: Some(vec![level("100.00", "4")]),
        asks: None,
    };
    let next = reducers::book_delta(&book, &payload, &Sequence::from_u64(101)).unwrap();

    assert_eq!(next.bids.len(), 2);
    assert_eq!(next.best_bid().unwrap()[1], "4");
}

#[test]
fn unparseable_levels_are_rejected_not_applied() {
    let book = seeded_book();
    let payload = BookPayload {
        symbol: "BTC_USD".into(),
        bids: Some(vec![level("oops", "1")]),
        asks: None,
    };
    assert!(reducers::book_delta(&book, &payload, &Sequence::from_u64(101)).is_err());
}

#[test]
fn ticker_starts_from_zeroes_and_merges() {
    let payload = TickerPayload {
        symbol: "BTC_USD".into(),
        last_price: None,
        volume_24h: Some("12.5".into()),
        high_24h: None,
        low_24h: None,
        mark_price: Some("100.1".into()),
    };
    let ticker = reducers::ticker_update(None, &payload, &Sequence::from_u64(7));
    assert_eq!(ticker.last_price, "0");
    assert_eq!(ticker.volume_24h, "12.5");
    assert_eq!(ticker.mark_price, "100.1");
    assert_eq!(ticker.last_seq, Sequence::from_u64(7));
}

#[test]
fn trade_identifier_falls_back_to_the_event_id() {
    let payload = TradePayload {
        symbol: "BTC_USD".into(),
        trade_id: None,
        price: "100.2".into(),
        quantity: "0.25".into(),
        side: Side::Sell,
        timestamp: None,
    };
    let tape = reducers::trade_append(&[], &payload, "evt-9", "1700000000000000000", 500);
    assert_eq!(tape.len(), 1);
    assert_eq!(tape[0].trade_id, "evt-9");
    assert_eq!(tape[0].timestamp, "1700000000000000000");
}
