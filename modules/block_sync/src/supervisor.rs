//! Wires the engine to the overlay's peer lifecycle: spawns the component
//! actors, creates and tears down per-peer subgraphs, and keeps dialing the
//! configured peers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use caryatid_sdk::{Context, Subscription};
use pharos_common::messages::{Message, OverlayRequest, OverlayResponse, PeerEventMessage};
use pharos_common::PeerId;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::configuration::SyncConfig;
use crate::download_manager::{DownloadCommand, DownloadManager, DownloadState};
use crate::gossip::{Gossip, GossipToggle};
use crate::peer_error::{BlacklistCommand, PeerErrorHandler, ScoreBoard};
use crate::peer_handler::HandlerSinks;
use crate::provider::{BdmiProvider, ProviderCommand};
use crate::sync_manager::{SyncEvent, SyncManager};

/// Dial backoff bounds for configured peers
const DIAL_BACKOFF_START: Duration = Duration::from_secs(1);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How long actors get to drain at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum SupervisorCommand {
    /// Ask the overlay to open a connection
    Dial { address: String },

    /// Drop a misbehaving peer now
    Disconnect { peer: PeerId },
}

pub struct Supervisor {
    context: Arc<Context<Message>>,
    config: SyncConfig,
    chain: ChainClient,
    peer_events: Box<dyn Subscription<Message>>,
    fork_heads: Box<dyn Subscription<Message>>,
    gossip_received: Box<dyn Subscription<Message>>,
    block_accepted: Box<dyn Subscription<Message>>,
    cancel: CancellationToken,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<Context<Message>>,
        config: SyncConfig,
        chain: ChainClient,
        peer_events: Box<dyn Subscription<Message>>,
        fork_heads: Box<dyn Subscription<Message>>,
        gossip_received: Box<dyn Subscription<Message>>,
        block_accepted: Box<dyn Subscription<Message>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            config,
            chain,
            peer_events,
            fork_heads,
            gossip_received,
            block_accepted,
            cancel,
        }
    }

    pub async fn run(self) {
        let Supervisor {
            context,
            config,
            chain,
            mut peer_events,
            fork_heads,
            gossip_received,
            block_accepted,
            cancel,
        } = self;
        let overlay_topic = config.topics.overlay_request.clone();

        // The chain service is authoritative for everything; wait for it
        let chain_id = match wait_for_chain(&chain, &cancel).await {
            Some(id) => Arc::new(id),
            None => return, // cancelled
        };
        info!(chain = %hex::encode(chain_id.as_slice()), "connected to chain service");

        let checkpoints = match config.node.parsed_checkpoints() {
            Ok(checkpoints) => Arc::new(checkpoints),
            Err(e) => {
                // validated at load, so this is a real bug
                warn!("invalid checkpoint configuration: {e}");
                return;
            }
        };

        // Fan-in channels shared by all handlers
        let (has_block_tx, has_block_rx) = mpsc::channel(1024);
        let (responses_tx, responses_rx) = mpsc::channel(128);
        let (heads_tx, heads_rx) = mpsc::channel(64);
        let (errors_tx, errors_rx) = mpsc::channel(256);
        let sinks = HandlerSinks {
            has_block: has_block_tx,
            heads: heads_tx,
            responses: responses_tx,
            errors: errors_tx.clone(),
        };

        // Component command channels
        let (provider_tx, provider_rx) = mpsc::channel(64);
        let (downloads_tx, downloads_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = mpsc::channel(64);
        let (gossip_tx, gossip_rx) = mpsc::channel(8);
        let (blacklist_tx, blacklist_rx) = mpsc::channel(16);
        let (supervisor_tx, mut supervisor_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);

        let mut actors = JoinSet::new();

        let provider = BdmiProvider::new(
            context.clone(),
            overlay_topic.clone(),
            config.peer_handler.clone(),
            chain_id,
            checkpoints.clone(),
            sinks,
            provider_rx,
            Duration::from_millis(config.bdmi.window_broadcast_interval_ms),
            cancel.child_token(),
        );
        actors.spawn(provider.run());

        let download_state = DownloadState::new(
            config.download_manager.clone(),
            checkpoints.clone(),
            config.sync_manager.max_pending_blocks,
        );
        let download_manager = DownloadManager::new(
            download_state,
            has_block_rx,
            responses_rx,
            downloads_rx,
            provider_tx.clone(),
            ready_tx.clone(),
            errors_tx.clone(),
            cancel.child_token(),
        );
        actors.spawn(download_manager.run());

        let sync_manager = SyncManager::new(
            config.sync_manager.clone(),
            chain.clone(),
            provider_tx.clone(),
            downloads_tx.clone(),
            gossip_tx,
            errors_tx.clone(),
            ready_rx,
            heads_rx,
            events_rx,
            fork_heads,
            GossipToggle::new(config.gossip_toggle.clone()),
            config.gossip_toggle.lag_tolerance,
            cancel.child_token(),
        );
        actors.spawn(sync_manager.run());

        let gossip = Gossip::new(
            context.clone(),
            overlay_topic.clone(),
            chain.clone(),
            gossip_rx,
            gossip_received,
            block_accepted,
            ready_tx,
            supervisor_tx.clone(),
            errors_tx,
            checkpoints,
            config.node.listen_addr.clone(),
            config.node.enable_peer_exchange,
            cancel.child_token(),
        );
        actors.spawn(gossip.run());

        let error_handler = PeerErrorHandler::new(
            ScoreBoard::new(config.blacklist.clone()),
            errors_rx,
            blacklist_rx,
            supervisor_tx,
            cancel.child_token(),
        );
        actors.spawn(error_handler.run());

        // Configured peers are permanent: dial now, re-dial whenever they drop
        let initial: HashSet<String> = config
            .node
            .initial_peers
            .iter()
            .chain(config.node.direct_peers.iter())
            .cloned()
            .collect();
        let mut dialers = JoinSet::new();
        for address in &initial {
            dialers.spawn(dial_with_backoff(
                context.clone(),
                overlay_topic.clone(),
                address.clone(),
                cancel.child_token(),
            ));
        }

        let mut addresses: HashMap<PeerId, String> = HashMap::new();
        loop {
            select! {
                _ = cancel.cancelled() => break,
                event = peer_events.read() => {
                    let Ok((_, message)) = event else { break };
                    let Message::PeerEvent(event) = message.as_ref() else {
                        warn!("unexpected message on peer-events topic");
                        continue;
                    };
                    match event {
                        PeerEventMessage::Connected { peer, address } => {
                            if peer_blocked(&blacklist_tx, peer).await {
                                info!(peer = %peer, "refusing blocked peer");
                                overlay_disconnect(&context, &overlay_topic, peer).await;
                                continue;
                            }
                            info!(peer = %peer, address = %address, "peer connected");
                            addresses.insert(peer.clone(), address.clone());
                            let _ = provider_tx
                                .send(ProviderCommand::AddPeer { peer: peer.clone() })
                                .await;
                            let _ = events_tx
                                .send(SyncEvent::PeerConnected(peer.clone()))
                                .await;
                        }
                        PeerEventMessage::Disconnected { peer } => {
                            info!(peer = %peer, "peer disconnected");
                            teardown_peer(peer, &provider_tx, &downloads_tx, &events_tx).await;
                            if let Some(address) = addresses.remove(peer) {
                                if initial.contains(&address) {
                                    dialers.spawn(dial_with_backoff(
                                        context.clone(),
                                        overlay_topic.clone(),
                                        address,
                                        cancel.child_token(),
                                    ));
                                }
                            }
                        }
                    }
                }
                command = supervisor_rx.recv() => {
                    match command {
                        Some(SupervisorCommand::Dial { address }) => {
                            if !addresses.values().any(|a| *a == address) {
                                debug!(address = %address, "dialing exchanged peer");
                                dial_once(&context, &overlay_topic, &address).await;
                            }
                        }
                        Some(SupervisorCommand::Disconnect { peer }) => {
                            overlay_disconnect(&context, &overlay_topic, &peer).await;
                            teardown_peer(&peer, &provider_tx, &downloads_tx, &events_tx).await;
                            addresses.remove(&peer);
                        }
                        None => break,
                    }
                }
            }
        }

        // Shutdown: cancel the tree and give actors a bounded drain
        cancel.cancel();
        dialers.abort_all();
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while actors.join_next().await.is_some() {}
        })
        .await;
        actors.abort_all();
        info!("sync engine stopped");
    }
}

/// Retry until the chain service answers; it may still be starting up
async fn wait_for_chain(chain: &ChainClient, cancel: &CancellationToken) -> Option<Vec<u8>> {
    let mut delay = DIAL_BACKOFF_START;
    loop {
        match chain.get_chain_id().await {
            Ok(id) => return Some(id),
            Err(e) => debug!("chain service not ready: {e}"),
        }
        select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(DIAL_BACKOFF_MAX);
    }
}

async fn teardown_peer(
    peer: &PeerId,
    provider: &mpsc::Sender<ProviderCommand>,
    downloads: &mpsc::Sender<DownloadCommand>,
    events: &mpsc::Sender<SyncEvent>,
) {
    let _ = provider.send(ProviderCommand::RemovePeer { peer: peer.clone() }).await;
    let _ = downloads.send(DownloadCommand::PeerDisconnected(peer.clone())).await;
    let _ = events.send(SyncEvent::PeerDisconnected(peer.clone())).await;
}

async fn peer_blocked(blacklist: &mpsc::Sender<BlacklistCommand>, peer: &PeerId) -> bool {
    let (reply, answer) = oneshot::channel();
    let command = BlacklistCommand::CheckPeer {
        peer: peer.clone(),
        reply,
    };
    if blacklist.send(command).await.is_err() {
        return false;
    }
    answer.await.unwrap_or(false)
}

async fn overlay_disconnect(context: &Arc<Context<Message>>, topic: &str, peer: &PeerId) {
    let message = Arc::new(Message::OverlayRequest(OverlayRequest::Disconnect {
        peer: peer.clone(),
    }));
    if let Err(e) = context.message_bus.request(topic, message).await {
        warn!(peer = %peer, "overlay disconnect failed: {e}");
    }
}

async fn dial_once(context: &Arc<Context<Message>>, topic: &str, address: &str) {
    let message = Arc::new(Message::OverlayRequest(OverlayRequest::Dial {
        address: address.to_string(),
    }));
    match context.message_bus.request(topic, message).await {
        Ok(response) => {
            if let Message::OverlayResponse(OverlayResponse::Error(e)) = response.as_ref() {
                debug!(address = %address, "dial failed: {e}");
            }
        }
        Err(e) => debug!(address = %address, "dial failed: {e}"),
    }
}

/// Keep trying to connect to a configured peer, backing off exponentially
async fn dial_with_backoff(
    context: Arc<Context<Message>>,
    topic: String,
    address: String,
    cancel: CancellationToken,
) {
    let mut delay = DIAL_BACKOFF_START;
    loop {
        info!(address = %address, "dialing peer");
        let message = Arc::new(Message::OverlayRequest(OverlayRequest::Dial {
            address: address.clone(),
        }));
        match context.message_bus.request(&topic, message).await {
            Ok(response) => match response.as_ref() {
                Message::OverlayResponse(OverlayResponse::Error(e)) => {
                    debug!(address = %address, "dial failed: {e}");
                }
                _ => return, // connected; the peer event does the rest
            },
            Err(e) => debug!(address = %address, "dial failed: {e}"),
        }
        select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(DIAL_BACKOFF_MAX);
    }
}
