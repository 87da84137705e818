//! Event-sourced state store.
//!
//! Routes snapshot and delta events into per-domain reducers, deduplicates,
//! detects sequence gaps independently of the transport, buffers deltas that
//! arrive ahead of their stream, and escalates to snapshot requests when a
//! gap cannot be closed locally.

pub mod reducers;
pub mod sequence;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::gateway::types::{
    AccountDeltaPayload, AccountSnapshotPayload, BookPayload, Channel, Event, EventKind,
    TickerPayload, TradePayload, TradeTapePayload,
};
use crate::metrics::{StoreCounters, StoreMetrics};

use self::sequence::{SeqMeta, Sequence};
use self::types::{
    Account, DomainKey, Orderbook, SnapshotRequest, StateChange, StateSnapshot, Ticker, Trade,
};

/// Bounds for the three memory-limiting mechanisms. None may be disabled.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum trades retained per symbol, oldest evicted first.
    pub trade_tape_cap: usize,
    /// Maximum deltas buffered per stream before forcing a full resync.
    pub delta_buffer_cap: usize,
    /// Maximum recently-seen event ids retained per stream for dedup.
    pub seen_ids_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            trade_tape_cap: 500,
            delta_buffer_cap: 10_000,
            seen_ids_cap: 10_000,
        }
    }
}

type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;
type RecoveryListener = Arc<dyn Fn(&SnapshotRequest) + Send + Sync>;

/// Handle returned by the listener registration methods; pass it back to
/// [`Store::remove_listener`] to unsubscribe.
#[derive(Debug)]
pub struct ListenerHandle {
    kind: ListenerKind,
    id: u64,
}

#[derive(Debug, Clone, Copy)]
enum ListenerKind {
    StateChange,
    Recovery,
}

#[derive(Debug, Default)]
struct StoreState {
    orderbooks: HashMap<String, Orderbook>,
    tickers: HashMap<String, Ticker>,
    trades: HashMap<String, Vec<Trade>>,
    account: Option<Account>,
    seq: HashMap<DomainKey, SeqMeta>,
    buffers: HashMap<DomainKey, BTreeMap<Sequence, Event>>,
}

/// Everything one `dispatch` call produced, collected under the state lock
/// and emitted after it is released.
#[derive(Default)]
struct Outcome {
    applied: u64,
    ignored: bool,
    dropped: bool,
    gap: bool,
    overflow: bool,
    changes: Vec<StateChange>,
    requests: Vec<SnapshotRequest>,
}

#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error("payload does not match its source channel: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Reduce(#[from] reducers::ReduceError),
}

/// The state store. All mutation happens through [`Store::dispatch`]; reads
/// return owned copies of the projections.
pub struct Store {
    cfg: StoreConfig,
    state: RwLock<StoreState>,
    state_listeners: Mutex<HashMap<u64, StateListener>>,
    recovery_listeners: Mutex<HashMap<u64, RecoveryListener>>,
    next_listener_id: AtomicU64,
    counters: StoreCounters,
}

impl Store {
    pub fn new(cfg: StoreConfig) -> Self {
        Self {
            cfg,
            state: RwLock::new(StoreState::default()),
            state_listeners: Mutex::new(HashMap::new()),
            recovery_listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            counters: StoreCounters::default(),
        }
    }

    /// Route an event into the pipeline. Never panics into the caller:
    /// every failure mode becomes a metric or a recovery request.
    pub fn dispatch(&self, event: Event) {
        let Some(key) = DomainKey::of(&event) else {
            debug!(
                event_id = %event.event_id,
                source = %event.source,
                "dropping event without a stream identity"
            );
            self.counters.record_dropped();
            return;
        };

        let mut out = Outcome::default();
        {
            let mut state = self.state.write();
            self.process(&mut state, &key, event, &mut out);
        }

        for _ in 0..out.applied {
            self.counters.record_applied();
        }
        if out.ignored {
            self.counters.record_ignored();
        }
        if out.dropped {
            self.counters.record_dropped();
        }
        if out.gap {
            self.counters.record_gap();
        }
        if out.overflow {
            self.counters.record_buffer_overflow();
        }
        for _ in 0..out.requests.len() {
            self.counters.record_snapshot_requested();
        }

        if !out.requests.is_empty() {
            let listeners: Vec<RecoveryListener> =
                self.recovery_listeners.lock().values().cloned().collect();
            for request in &out.requests {
                for listener in &listeners {
                    listener(request);
                }
            }
        }
        if !out.changes.is_empty() {
            let listeners: Vec<StateListener> =
                self.state_listeners.lock().values().cloned().collect();
            for change in &out.changes {
                for listener in &listeners {
                    listener(change);
                }
            }
        }
    }

    fn process(&self, state: &mut StoreState, key: &DomainKey, event: Event, out: &mut Outcome) {
        {
            let meta = state
                .seq
                .entry(key.clone())
                .or_insert_with(|| SeqMeta::new(self.cfg.seen_ids_cap));
            let duplicate = meta.seen_ids.contains(&event.event_id)
                || (event.kind != EventKind::Snapshot && event.sequence <= meta.last_seq);
            if duplicate {
                debug!(
                    event_id = %event.event_id,
                    sequence = %event.sequence,
                    stream = %key,
                    "ignoring duplicate event"
                );
                out.ignored = true;
                return;
            }
        }

        match event.kind {
            EventKind::Snapshot => {
                // Snapshots replace the projection wholesale and are accepted
                // regardless of the current cursor.
                match Self::apply_event(&self.cfg, state, &event) {
                    Ok(changes) => {
                        Self::commit(state, key, &event, changes, out);
                        self.flush_buffer(state, key, out);
                    }
                    Err(error) => {
                        warn!(%error, event_id = %event.event_id, "dropping snapshot");
                        out.dropped = true;
                    }
                }
            }
            EventKind::Delta => {
                let last_seq = state
                    .seq
                    .get(key)
                    .map(|meta| meta.last_seq.clone())
                    .unwrap_or_default();
                if event.sequence == last_seq.next() {
                    match Self::apply_event(&self.cfg, state, &event) {
                        Ok(changes) => {
                            Self::commit(state, key, &event, changes, out);
                            self.flush_buffer(state, key, out);
                        }
                        Err(error) => {
                            warn!(%error, event_id = %event.event_id, "dropping delta");
                            out.dropped = true;
                        }
                    }
                } else {
                    // sequence > expected: behind-cursor deltas were already
                    // ignored as duplicates above.
                    let synced = !last_seq.is_zero();
                    if synced {
                        warn!(
                            stream = %key,
                            expected = %last_seq.next(),
                            got = %event.sequence,
                            "sequence gap detected"
                        );
                        out.gap = true;
                    } else {
                        debug!(
                            stream = %key,
                            sequence = %event.sequence,
                            "buffering delta ahead of initial snapshot"
                        );
                    }
                    let since_seq = if synced { last_seq } else { Sequence::zero() };
                    self.buffer_delta(state, key, event, since_seq, out);
                }
            }
        }
    }

    /// Record an applied event against its stream cursor and dedup window.
    fn commit(
        state: &mut StoreState,
        key: &DomainKey,
        event: &Event,
        changes: Vec<StateChange>,
        out: &mut Outcome,
    ) {
        if let Some(meta) = state.seq.get_mut(key) {
            meta.last_seq = event.sequence.clone();
            meta.seen_ids.insert(&event.event_id);
        }
        out.applied += 1;
        out.changes.extend(changes);
    }

    fn buffer_delta(
        &self,
        state: &mut StoreState,
        key: &DomainKey,
        event: Event,
        since_seq: Sequence,
        out: &mut Outcome,
    ) {
        let Some(params) = event.stream_params() else {
            out.dropped = true;
            return;
        };
        let channel = event.source;
        let buffer = state.buffers.entry(key.clone()).or_default();

        if buffer.len() >= self.cfg.delta_buffer_cap {
            // The stream is unrecoverable locally: discard everything and
            // ask for a fresh snapshot.
            warn!(stream = %key, cap = self.cfg.delta_buffer_cap, "delta buffer overflow, forcing resync");
            buffer.clear();
            out.overflow = true;
            out.requests.push(SnapshotRequest {
                channel,
                params,
                since_seq: Sequence::zero(),
            });
            return;
        }

        buffer.insert(event.sequence.clone(), event);
        out.requests.push(SnapshotRequest {
            channel,
            params,
            since_seq,
        });
    }

    /// Drain the stream's buffer from the front: discard entries the cursor
    /// has passed, apply the ones that line up, halt at the first remaining
    /// gap.
    fn flush_buffer(&self, state: &mut StoreState, key: &DomainKey, out: &mut Outcome) {
        loop {
            let Some(last_seq) = state.seq.get(key).map(|meta| meta.last_seq.clone()) else {
                return;
            };
            let front = state
                .buffers
                .get(key)
                .and_then(|buffer| buffer.first_key_value().map(|(seq, _)| seq.clone()));
            let Some(front) = front else { return };

            if front <= last_seq {
                if let Some(buffer) = state.buffers.get_mut(key) {
                    buffer.pop_first();
                }
                continue;
            }
            if front != last_seq.next() {
                return;
            }

            let popped = state
                .buffers
                .get_mut(key)
                .and_then(|buffer| buffer.pop_first());
            let Some((_, event)) = popped else { return };

            match Self::apply_event(&self.cfg, state, &event) {
                Ok(changes) => Self::commit(state, key, &event, changes, out),
                Err(error) => {
                    warn!(%error, event_id = %event.event_id, "dropping buffered delta");
                    out.dropped = true;
                    return;
                }
            }
        }
    }

    fn apply_event(
        cfg: &StoreConfig,
        state: &mut StoreState,
        event: &Event,
    ) -> Result<Vec<StateChange>, ApplyError> {
        match event.source {
            Channel::MarketData => {
                let has_book_fields =
                    event.payload.get("bids").is_some() || event.payload.get("asks").is_some();
                if has_book_fields {
                    let payload: BookPayload = serde_json::from_value(event.payload.clone())?;
                    let symbol = payload.symbol.clone();
                    let next = match event.kind {
                        EventKind::Snapshot => reducers::book_snapshot(&payload, &event.sequence)?,
                        EventKind::Delta => {
                            let base = Orderbook::new(symbol.clone());
                            let prev = state.orderbooks.get(&symbol).unwrap_or(&base);
                            reducers::book_delta(prev, &payload, &event.sequence)?
                        }
                    };
                    state.orderbooks.insert(symbol.clone(), next);
                    Ok(vec![StateChange::Orderbook { symbol }])
                } else {
                    let payload: TickerPayload = serde_json::from_value(event.payload.clone())?;
                    let symbol = payload.symbol.clone();
                    let prev = match event.kind {
                        EventKind::Snapshot => None,
                        EventKind::Delta => state.tickers.get(&symbol),
                    };
                    let next = reducers::ticker_update(prev, &payload, &event.sequence);
                    state.tickers.insert(symbol.clone(), next);
                    Ok(vec![StateChange::Ticker { symbol }])
                }
            }
            Channel::Trades => {
                let is_tape =
                    event.kind == EventKind::Snapshot || event.payload.get("trades").is_some();
                if is_tape {
                    let payload: TradeTapePayload = serde_json::from_value(event.payload.clone())?;
                    let symbol = payload.symbol.clone();
                    let tape = reducers::trade_tape_snapshot(
                        &payload,
                        &event.event_id,
                        &event.timestamp,
                        cfg.trade_tape_cap,
                    );
                    state.trades.insert(symbol.clone(), tape);
                    Ok(vec![StateChange::Trades { symbol }])
                } else {
                    let payload: TradePayload = serde_json::from_value(event.payload.clone())?;
                    let symbol = payload.symbol.clone();
                    let tape = state.trades.get(&symbol).map(Vec::as_slice).unwrap_or(&[]);
                    let next = reducers::trade_append(
                        tape,
                        &payload,
                        &event.event_id,
                        &event.timestamp,
                        cfg.trade_tape_cap,
                    );
                    state.trades.insert(symbol.clone(), next);
                    Ok(vec![StateChange::Trades { symbol }])
                }
            }
            Channel::Account => {
                match event.kind {
                    EventKind::Snapshot => {
                        let payload: AccountSnapshotPayload =
                            serde_json::from_value(event.payload.clone())?;
                        state.account = Some(reducers::account_snapshot(&payload, &event.sequence));
                    }
                    EventKind::Delta => {
                        let payload: AccountDeltaPayload =
                            serde_json::from_value(event.payload.clone())?;
                        state.account = Some(reducers::account_delta(
                            state.account.as_ref(),
                            &payload,
                            &event.sequence,
                        ));
                    }
                }
                Ok(vec![StateChange::Account])
            }
        }
    }

    /// Register a listener invoked after every committed mutation.
    pub fn on_state_change(
        &self,
        listener: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.state_listeners.lock().insert(id, Arc::new(listener));
        ListenerHandle {
            kind: ListenerKind::StateChange,
            id,
        }
    }

    /// Register a callback invoked when a stream needs the transport to
    /// replay it from `since_seq`.
    pub fn on_request_snapshot(
        &self,
        listener: impl Fn(&SnapshotRequest) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.recovery_listeners.lock().insert(id, Arc::new(listener));
        ListenerHandle {
            kind: ListenerKind::Recovery,
            id,
        }
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        match handle.kind {
            ListenerKind::StateChange => {
                self.state_listeners.lock().remove(&handle.id);
            }
            ListenerKind::Recovery => {
                self.recovery_listeners.lock().remove(&handle.id);
            }
        }
    }

    pub fn orderbook(&self, symbol: &str) -> Option<Orderbook> {
        self.state.read().orderbooks.get(symbol).cloned()
    }

    pub fn ticker(&self, symbol: &str) -> Option<Ticker> {
        self.state.read().tickers.get(symbol).cloned()
    }

    pub fn trades(&self, symbol: &str) -> Vec<Trade> {
        self.state
            .read()
            .trades
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn account(&self) -> Option<Account> {
        self.state.read().account.clone()
    }

    /// Owned copy of every projection.
    pub fn state(&self) -> StateSnapshot {
        let state = self.state.read();
        StateSnapshot {
            orderbooks: state
                .orderbooks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            tickers: state
                .tickers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            trades: state
                .trades
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            account: state.account.clone(),
        }
    }

    /// Cursor of the last applied event on a stream; zero when none.
    pub fn last_seq(&self, key: &DomainKey) -> Sequence {
        self.state
            .read()
            .seq
            .get(key)
            .map(|meta| meta.last_seq.clone())
            .unwrap_or_default()
    }

    /// Number of deltas currently buffered for a stream.
    pub fn buffered(&self, key: &DomainKey) -> usize {
        self.state
            .read()
            .buffers
            .get(key)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> StoreMetrics {
        self.counters.snapshot()
    }

    /// Drop every projection and cursor. Used on session teardown; the
    /// server resupplies state through snapshots on the next connection.
    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = StoreState::default();
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
