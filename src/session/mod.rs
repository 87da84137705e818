//! Session ownership and wiring.
//!
//! A session controller owns exactly one store and one gateway client and
//! integrates them through narrow callbacks, so neither component holds a
//! hard reference to the other and both can be replaced in tests. Tearing
//! the session down closes the connection and resets every projection.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::client::{GatewayClient, TokenProvider};
use crate::gateway::types::{Channel, Params, SubscribeError, TransportError};
use crate::store::Store;
use crate::store::types::SnapshotRequest;

/// Owner of one store + one gateway client pair.
pub struct SessionController {
    store: Arc<Store>,
    client: Arc<GatewayClient>,
}

impl SessionController {
    pub fn new(cfg: &Config, tokens: Arc<dyn TokenProvider>) -> Self {
        let store = Arc::new(Store::new(cfg.store_config()));
        let client = Arc::new(GatewayClient::new(cfg.gateway_config(), tokens));

        // Transport -> store: every data event goes through dispatch. Weak
        // references keep the two components independently droppable.
        for channel in Channel::ALL {
            let store = Arc::downgrade(&store);
            client.on_event(channel, move |event| {
                if let Some(store) = store.upgrade() {
                    store.dispatch(event.clone());
                }
            });
        }

        // Store -> transport: recovery requests become snapshot_since frames,
        // or a forced re-subscribe when the stream needs a fresh snapshot.
        let weak_client = Arc::downgrade(&client);
        store.on_request_snapshot(move |request| {
            if let Some(client) = weak_client.upgrade() {
                handle_recovery(&client, request);
            }
        });

        client.on_error(|error| warn!(%error, "gateway error"));

        Self { store, client }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn client(&self) -> &Arc<GatewayClient> {
        &self.client
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        self.client.connect().await
    }

    /// Subscribe to market data and trades for one symbol.
    pub async fn subscribe_symbol(&self, symbol: &str) -> Result<(), SubscribeError> {
        let mut params = Params::new();
        params.insert("symbol".to_string(), symbol.to_string());
        self.client
            .subscribe(Channel::MarketData, params.clone())
            .await?;
        self.client.subscribe(Channel::Trades, params).await
    }

    /// Subscribe to the authenticated account stream.
    pub async fn subscribe_account(&self) -> Result<(), SubscribeError> {
        self.client.subscribe(Channel::Account, Params::new()).await
    }

    /// Close the connection and drop every projection. The server resupplies
    /// state via snapshots on the next session.
    pub fn shutdown(&self) {
        info!("shutting down session");
        self.client.disconnect();
        self.store.reset();
    }
}

fn handle_recovery(client: &Arc<GatewayClient>, request: &SnapshotRequest) {
    if request.since_seq.is_zero() {
        // Full resync: a fresh subscribe makes the server answer with a new
        // snapshot for the stream.
        let client = Arc::clone(client);
        let channel = request.channel;
        let params = request.params.clone();
        tokio::spawn(async move {
            if let Err(error) = client.resubscribe(channel, params).await {
                warn!(%error, %channel, "resync subscribe failed");
            }
        });
    } else if let Err(error) = client.request_snapshot_since(
        request.channel,
        request.params.clone(),
        &request.since_seq,
    ) {
        debug!(%error, channel = %request.channel, "snapshot_since request not sent");
    }
}
