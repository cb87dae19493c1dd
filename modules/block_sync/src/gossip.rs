//! Gossip control: the hysteretic on/off toggle and the actor that joins
//! and leaves the gossip topics, forwards inbound traffic and publishes
//! locally accepted blocks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use caryatid_sdk::{Context, Subscription};
use pharos_common::messages::{
    BlockAcceptedMessage, GossipReceivedMessage, GossipedBlock, Message, OverlayRequest,
};
use pharos_common::{ApplyTxResult, Checkpoint, PeerErrorKind, PeerId};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::configuration::GossipToggleConfig;
use crate::download_manager::ReadyBlock;
use crate::peer_handler::PeerError;
use crate::supervisor::SupervisorCommand;

/// Gossip wire topic names, shared by every node on the network
pub const BLOCKS_TOPIC: &str = "blocks";
pub const TRANSACTIONS_TOPIC: &str = "transactions";
pub const PEERS_TOPIC: &str = "peers";

/// Hysteretic gossip on/off decision.
///
/// Input is the fraction of peers at or above our head; two thresholds and
/// a debounce keep the toggle from flapping while the node hovers around
/// the network head.
pub struct GossipToggle {
    config: GossipToggleConfig,
    enabled: bool,
    last_change: Option<Instant>,
}

impl GossipToggle {
    pub fn new(config: GossipToggleConfig) -> Self {
        Self {
            config,
            enabled: false,
            last_change: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Feed a fresh observation; returns the new state when it changed
    pub fn update(
        &mut self,
        caught_up_fraction: f64,
        total_peers: usize,
        now: Instant,
    ) -> Option<bool> {
        let pinned = self.config.always_enable || self.config.always_disable;
        let target = if self.config.always_enable {
            true
        } else if self.config.always_disable || total_peers == 0 {
            false
        } else if self.enabled {
            caught_up_fraction > self.config.disable_threshold
        } else {
            caught_up_fraction >= self.config.enable_threshold
        };

        if target == self.enabled {
            return None;
        }
        if !pinned {
            let interval = Duration::from_millis(self.config.min_toggle_interval_ms);
            if let Some(last) = self.last_change {
                if now.duration_since(last) < interval {
                    return None;
                }
            }
        }
        self.enabled = target;
        self.last_change = Some(now);
        Some(target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipCommand {
    Enable,
    Disable,
}

/// The actor behind the toggle: owns the overlay-side subscriptions and
/// the forwarding paths for blocks, transactions and exchanged peers.
pub struct Gossip {
    context: Arc<Context<Message>>,
    overlay_topic: String,
    chain: ChainClient,
    commands: mpsc::Receiver<GossipCommand>,
    received: Box<dyn Subscription<Message>>,
    accepted: Box<dyn Subscription<Message>>,
    ready: mpsc::Sender<ReadyBlock>,
    supervisor: mpsc::Sender<SupervisorCommand>,
    errors: mpsc::Sender<PeerError>,
    checkpoints: Arc<Vec<Checkpoint>>,
    own_address: String,
    peer_exchange: bool,
    enabled: bool,
    seen_addresses: HashSet<String>,
    cancel: CancellationToken,
}

impl Gossip {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<Context<Message>>,
        overlay_topic: String,
        chain: ChainClient,
        commands: mpsc::Receiver<GossipCommand>,
        received: Box<dyn Subscription<Message>>,
        accepted: Box<dyn Subscription<Message>>,
        ready: mpsc::Sender<ReadyBlock>,
        supervisor: mpsc::Sender<SupervisorCommand>,
        errors: mpsc::Sender<PeerError>,
        checkpoints: Arc<Vec<Checkpoint>>,
        own_address: String,
        peer_exchange: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            overlay_topic,
            chain,
            commands,
            received,
            accepted,
            ready,
            supervisor,
            errors,
            checkpoints,
            own_address,
            peer_exchange,
            enabled: false,
            seen_addresses: HashSet::new(),
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                _ = self.cancel.cancelled() => return,
                command = self.commands.recv() => {
                    match command {
                        Some(GossipCommand::Enable) => self.set_enabled(true).await,
                        Some(GossipCommand::Disable) => self.set_enabled(false).await,
                        None => return,
                    }
                }
                message = self.received.read() => {
                    match message {
                        Ok((_, message)) => self.handle_received(message.as_ref()).await,
                        Err(_) => return,
                    }
                }
                message = self.accepted.read() => {
                    match message {
                        Ok((_, message)) => self.handle_accepted(message.as_ref()).await,
                        Err(_) => return,
                    }
                }
            }
        }
    }

    /// Join or leave the topic meshes. Leaving really unsubscribes at the
    /// overlay; merely dropping inbound messages would keep us relaying.
    async fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        info!(enabled, "gossip toggled");
        let mut topics = vec![BLOCKS_TOPIC, TRANSACTIONS_TOPIC];
        if self.peer_exchange {
            topics.push(PEERS_TOPIC);
        }
        for topic in topics {
            self.overlay_request(OverlayRequest::SetGossipSubscription {
                topic: topic.to_string(),
                subscribed: enabled,
            })
            .await;
        }
        if enabled && self.peer_exchange {
            let data = self.own_address.clone().into_bytes();
            self.overlay_request(OverlayRequest::PublishGossip {
                topic: PEERS_TOPIC.to_string(),
                data,
            })
            .await;
        }
    }

    async fn handle_received(&mut self, message: &Message) {
        let Message::GossipReceived(GossipReceivedMessage { topic, from, data }) = message
        else {
            warn!("unexpected message on gossip-received topic");
            return;
        };
        if !self.enabled {
            return; // unsubscribe is in flight
        }
        match topic.as_str() {
            BLOCKS_TOPIC => self.handle_block(from.clone(), data).await,
            TRANSACTIONS_TOPIC => self.handle_transaction(from.clone(), data).await,
            PEERS_TOPIC => self.handle_peer_address(data).await,
            other => debug!(topic = other, "ignoring unknown gossip topic"),
        }
    }

    async fn handle_block(&mut self, from: PeerId, data: &[u8]) {
        let gossiped: GossipedBlock = match serde_json::from_slice(data) {
            Ok(block) => block,
            Err(e) => {
                debug!(peer = %from, "undecodable gossip block: {e}");
                let _ = self
                    .errors
                    .send(PeerError {
                        peer: from,
                        kind: PeerErrorKind::MalformedBlock,
                    })
                    .await;
                return;
            }
        };
        // Checkpoints gate gossip exactly as they gate downloads
        if let Some(cp) =
            self.checkpoints.iter().find(|cp| cp.height == gossiped.topology.height)
        {
            if cp.id != gossiped.topology.id {
                warn!(peer = %from, block = %gossiped.topology, "gossiped block contradicts checkpoint");
                let _ = self
                    .errors
                    .send(PeerError {
                        peer: from,
                        kind: PeerErrorKind::CheckpointMismatch,
                    })
                    .await;
                return;
            }
        }
        // Same apply pipeline as downloaded blocks; an unknown parent just
        // parks it until the parent arrives
        let block = ReadyBlock {
            peer: from,
            topology: gossiped.topology,
            block: gossiped.block,
        };
        select! {
            _ = self.cancel.cancelled() => {}
            _ = self.ready.send(block) => {}
        }
    }

    async fn handle_transaction(&mut self, from: PeerId, data: &[u8]) {
        match self.chain.apply_transaction(data.to_vec()).await {
            Ok(ApplyTxResult::Accepted) => {}
            Ok(ApplyTxResult::Rejected(reason)) => {
                // Not misbehaviour: duplicates, fee and mempool rejections
                // are routine on a busy network
                debug!(peer = %from, "gossiped transaction rejected: {reason}");
            }
            Err(e) => debug!("transaction apply failed: {e}"),
        }
    }

    async fn handle_peer_address(&mut self, data: &[u8]) {
        if !self.peer_exchange {
            return;
        }
        let Ok(address) = String::from_utf8(data.to_vec()) else {
            return;
        };
        if address == self.own_address || !self.seen_addresses.insert(address.clone()) {
            return;
        }
        let _ = self.supervisor.send(SupervisorCommand::Dial { address }).await;
    }

    /// Push our own accepted blocks out to the network
    async fn handle_accepted(&mut self, message: &Message) {
        let Message::BlockAccepted(BlockAcceptedMessage {
            topology,
            block,
            own,
        }) = message
        else {
            warn!("unexpected message on block-accepted topic");
            return;
        };
        if !self.enabled || !own {
            return;
        }
        let gossiped = GossipedBlock {
            topology: *topology,
            block: block.clone(),
        };
        match serde_json::to_vec(&gossiped) {
            Ok(data) => {
                self.overlay_request(OverlayRequest::PublishGossip {
                    topic: BLOCKS_TOPIC.to_string(),
                    data,
                })
                .await;
            }
            Err(e) => warn!("could not encode block for gossip: {e}"),
        }
    }

    async fn overlay_request(&self, request: OverlayRequest) {
        let message = Arc::new(Message::OverlayRequest(request));
        if let Err(e) = self.context.message_bus.request(&self.overlay_topic, message).await {
            warn!("overlay request failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toggle_config() -> GossipToggleConfig {
        GossipToggleConfig {
            enable_threshold: 0.66,
            disable_threshold: 0.33,
            always_enable: false,
            always_disable: false,
            lag_tolerance: 0,
            min_toggle_interval_ms: 10_000,
        }
    }

    fn toggle() -> GossipToggle {
        GossipToggle::new(toggle_config())
    }

    #[test]
    fn enables_once_enough_peers_are_caught_up() {
        let mut toggle = toggle();
        let now = Instant::now();
        // 6 of 10 peers caught up: below the enable threshold
        assert_eq!(toggle.update(0.6, 10, now), None);
        assert!(!toggle.enabled());
        // one more catches up
        assert_eq!(toggle.update(0.7, 10, now), Some(true));
        assert!(toggle.enabled());
    }

    #[test]
    fn disables_when_peers_pull_ahead() {
        let mut toggle = toggle();
        let now = Instant::now();
        toggle.update(1.0, 10, now);
        assert!(toggle.enabled());

        let later = now + Duration::from_secs(11);
        assert_eq!(toggle.update(0.33, 10, later), Some(false));
    }

    #[test]
    fn stable_between_thresholds() {
        let mut toggle = toggle();
        let mut now = Instant::now();
        // never changes state while the fraction sits between thresholds
        for _ in 0..10 {
            assert_eq!(toggle.update(0.5, 10, now), None);
            now += Duration::from_secs(60);
        }
        assert!(!toggle.enabled());

        toggle.update(0.9, 10, now);
        assert!(toggle.enabled());
        for _ in 0..10 {
            now += Duration::from_secs(60);
            assert_eq!(toggle.update(0.5, 10, now), None);
        }
        assert!(toggle.enabled());
    }

    #[test]
    fn rapid_flapping_is_debounced() {
        let mut toggle = toggle();
        let now = Instant::now();
        assert_eq!(toggle.update(0.9, 10, now), Some(true));
        // drops below the disable threshold a second later: held
        assert_eq!(toggle.update(0.1, 10, now + Duration::from_secs(1)), None);
        assert!(toggle.enabled());
        // still below after the debounce interval: released
        assert_eq!(
            toggle.update(0.1, 10, now + Duration::from_secs(11)),
            Some(false)
        );
    }

    #[test]
    fn no_peers_means_disabled() {
        let mut toggle = toggle();
        let now = Instant::now();
        toggle.update(1.0, 10, now);
        assert!(toggle.enabled());
        assert_eq!(
            toggle.update(0.0, 0, now + Duration::from_secs(11)),
            Some(false)
        );
    }

    #[test]
    fn override_flags_pin_the_state() {
        let mut config = toggle_config();
        config.always_enable = true;
        let mut toggle = GossipToggle::new(config);
        assert_eq!(toggle.update(0.0, 0, Instant::now()), Some(true));
        assert_eq!(toggle.update(0.0, 0, Instant::now()), None);
        assert!(toggle.enabled());

        let mut config = toggle_config();
        config.always_disable = true;
        let mut toggle = GossipToggle::new(config);
        assert_eq!(toggle.update(1.0, 10, Instant::now()), None);
        assert!(!toggle.enabled());
    }
}
