//! Top-level sync state machine: tracks the local head, drives the height
//! window and pushes downloaded blocks into the chain service in an order
//! it will accept.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use caryatid_sdk::Subscription;
use pharos_common::messages::{ForkHeadsMessage, Message};
use pharos_common::{
    ApplyBlockResult, BlockId, BlockTopology, HeightRange, LocalHead, PeerErrorKind, PeerId,
};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainError};
use crate::configuration::SyncManagerConfig;
use crate::download_manager::{DownloadCommand, ReadyBlock};
use crate::gossip::{GossipCommand, GossipToggle};
use crate::peer_handler::{PeerError, PeerHeadUpdate};
use crate::provider::ProviderCommand;

/// Cadence of state re-evaluation and chain-outage retries
const STATE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No peers at all
    Disconnected,

    /// Sampling peer heads to find out where the network is
    Checking,

    /// Behind the network; downloading with a wide window
    Syncing,

    /// Caught up; narrow window keeps short-fork awareness alive
    Gossiping,
}

/// Where the state machine should go, given what we can see now
pub(crate) fn next_state(
    current: SyncState,
    peer_count: usize,
    network_head: Option<u64>,
    local_height: u64,
    catch_up_slack: u64,
) -> SyncState {
    if peer_count == 0 {
        return SyncState::Disconnected;
    }
    let caught_up = |h: u64| h <= local_height + catch_up_slack;
    match current {
        SyncState::Disconnected => SyncState::Checking,
        SyncState::Checking => match network_head {
            None => SyncState::Checking,
            Some(h) if caught_up(h) => SyncState::Gossiping,
            Some(_) => SyncState::Syncing,
        },
        SyncState::Syncing => match network_head {
            Some(h) if caught_up(h) => SyncState::Gossiping,
            _ => SyncState::Syncing,
        },
        SyncState::Gossiping => match network_head {
            Some(h) if !caught_up(h) => SyncState::Syncing,
            _ => SyncState::Gossiping,
        },
    }
}

pub(crate) fn window_for(
    state: SyncState,
    local_height: u64,
    config: &SyncManagerConfig,
) -> HeightRange {
    match state {
        SyncState::Disconnected | SyncState::Checking => HeightRange::empty(),
        SyncState::Syncing => HeightRange::new(local_height + 1, config.sync_window_size),
        SyncState::Gossiping => HeightRange::new(local_height + 1, config.gossip_window_size),
    }
}

/// Blocks whose parent we have not applied yet, keyed by the parent id
#[derive(Default)]
pub(crate) struct PendingBlocks {
    by_parent: HashMap<BlockId, Vec<ReadyBlock>>,
    count: usize,
}

impl PendingBlocks {
    /// Returns false when the block was dropped because the map is full
    pub fn insert(&mut self, block: ReadyBlock, limit: usize) -> bool {
        let children = self.by_parent.entry(block.topology.previous).or_default();
        if children.iter().any(|c| c.topology.id == block.topology.id) {
            return true; // duplicate
        }
        if self.count >= limit {
            return false;
        }
        children.push(block);
        self.count += 1;
        true
    }

    pub fn take_children(&mut self, parent: &BlockId) -> Vec<ReadyBlock> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        self.count -= children.len();
        children
    }

    pub fn prune_below(&mut self, height: u64) {
        self.by_parent.retain(|_, children| {
            children.retain(|c| c.topology.height >= height);
            !children.is_empty()
        });
        self.count = self.by_parent.values().map(Vec::len).sum();
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

pub struct SyncManager {
    config: SyncManagerConfig,
    chain: ChainClient,
    provider: mpsc::Sender<ProviderCommand>,
    downloads: mpsc::Sender<DownloadCommand>,
    gossip: mpsc::Sender<GossipCommand>,
    errors: mpsc::Sender<PeerError>,
    ready: mpsc::Receiver<ReadyBlock>,
    heads: mpsc::Receiver<PeerHeadUpdate>,
    events: mpsc::Receiver<SyncEvent>,
    fork_heads: Box<dyn Subscription<Message>>,
    toggle: GossipToggle,
    lag_tolerance: u64,
    cancel: CancellationToken,

    state: SyncState,
    local_head: LocalHead,
    peers: HashMap<PeerId, Option<BlockTopology>>,
    pending: PendingBlocks,
    recently_applied: HashMap<BlockId, u64>,
    last_window: HeightRange,

    /// Set while the chain service is unreachable; cleared on the next
    /// successful call
    paused: bool,

    /// Blocks whose parent is known but whose apply hit a chain outage;
    /// re-driven once the service answers again
    stalled: VecDeque<ReadyBlock>,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncManagerConfig,
        chain: ChainClient,
        provider: mpsc::Sender<ProviderCommand>,
        downloads: mpsc::Sender<DownloadCommand>,
        gossip: mpsc::Sender<GossipCommand>,
        errors: mpsc::Sender<PeerError>,
        ready: mpsc::Receiver<ReadyBlock>,
        heads: mpsc::Receiver<PeerHeadUpdate>,
        events: mpsc::Receiver<SyncEvent>,
        fork_heads: Box<dyn Subscription<Message>>,
        toggle: GossipToggle,
        lag_tolerance: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            chain,
            provider,
            downloads,
            gossip,
            errors,
            ready,
            heads,
            events,
            fork_heads,
            toggle,
            lag_tolerance,
            cancel,
            state: SyncState::Disconnected,
            local_head: LocalHead::default(),
            peers: HashMap::new(),
            pending: PendingBlocks::default(),
            recently_applied: HashMap::new(),
            last_window: HeightRange::empty(),
            paused: false,
            stalled: VecDeque::new(),
        }
    }

    pub async fn run(mut self) {
        self.refresh_head().await;
        let mut tick = tokio::time::interval(STATE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.cancel.cancelled() => return,
                block = self.ready.recv() => {
                    let Some(block) = block else { return };
                    self.ingest_block(block).await;
                }
                update = self.heads.recv() => {
                    let Some(PeerHeadUpdate { peer, head }) = update else { return };
                    if let Some(entry) = self.peers.get_mut(&peer) {
                        *entry = Some(head);
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(SyncEvent::PeerConnected(peer)) => {
                            self.peers.entry(peer).or_insert(None);
                        }
                        Some(SyncEvent::PeerDisconnected(peer)) => {
                            self.peers.remove(&peer);
                        }
                        None => return,
                    }
                }
                message = self.fork_heads.read() => {
                    match message {
                        Ok((_, message)) => self.handle_fork_heads(message.as_ref()).await,
                        Err(_) => return,
                    }
                }
                _ = tick.tick() => {
                    if self.paused {
                        self.refresh_head().await;
                    }
                }
            }
            if !self.paused && !self.stalled.is_empty() {
                self.retry_stalled().await;
            }
            self.evaluate().await;
        }
    }

    /// A head change pushed by the chain service; external changes send us
    /// back through Checking
    async fn handle_fork_heads(&mut self, message: &Message) {
        let Message::ForkHeads(ForkHeadsMessage { head_info }) = message else {
            warn!("unexpected message on fork-heads topic");
            return;
        };
        let changed = *head_info != self.local_head;
        self.set_local_head(head_info.clone()).await;
        if changed && matches!(self.state, SyncState::Syncing | SyncState::Gossiping) {
            self.state = SyncState::Checking;
        }
    }

    async fn set_local_head(&mut self, head: LocalHead) {
        self.paused = false;
        if head == self.local_head {
            return;
        }
        self.local_head = head;
        let irreversible = self.local_head.last_irreversible.height;
        self.pending.prune_below(irreversible);
        self.recently_applied.retain(|_, height| *height >= irreversible);
        let _ = self
            .downloads
            .send(DownloadCommand::HeadChanged(self.local_head.clone()))
            .await;
    }

    async fn refresh_head(&mut self) {
        match self.chain.head_info().await {
            Ok(head) => {
                self.set_local_head(head).await;
            }
            Err(e) => {
                debug!("chain head refresh failed: {e}");
                self.paused = true;
            }
        }
    }

    /// True when the chain can accept this block right now
    fn parent_known(&self, topology: &BlockTopology) -> bool {
        let parent = &topology.previous;
        *parent == self.local_head.head.id
            || *parent == self.local_head.last_irreversible.id
            || self.local_head.is_fork_head(parent)
            || self.recently_applied.contains_key(parent)
    }

    /// Apply a block if its parent is known, chaining through any held
    /// children it unblocks; otherwise hold it until the parent lands.
    async fn ingest_block(&mut self, block: ReadyBlock) {
        if block.topology.height <= self.local_head.last_irreversible.height {
            return; // settled while it was in flight
        }
        if self.recently_applied.contains_key(&block.topology.id) {
            return;
        }
        if !self.parent_known(&block.topology) {
            if !self.pending.insert(block, self.config.max_pending_blocks as usize) {
                debug!(held = self.pending.len(), "pending-by-parent map full, dropping block");
            }
            return;
        }

        let mut queue = VecDeque::from([block]);
        let mut applied_any = false;
        while let Some(next) = queue.pop_front() {
            match self.apply_one(&next).await {
                ApplyOutcome::Applied => {
                    applied_any = true;
                    self.recently_applied.insert(next.topology.id, next.topology.height);
                    // optimistic head advance; the fork-heads broadcast is
                    // authoritative
                    if next.topology.previous == self.local_head.head.id {
                        self.local_head.head = next.topology;
                    }
                    queue.extend(self.pending.take_children(&next.topology.id));
                }
                ApplyOutcome::Duplicate => {
                    self.recently_applied.insert(next.topology.id, next.topology.height);
                    queue.extend(self.pending.take_children(&next.topology.id));
                }
                ApplyOutcome::Rejected => {
                    let _ = self
                        .errors
                        .send(PeerError {
                            peer: next.peer.clone(),
                            kind: PeerErrorKind::MalformedBlock,
                        })
                        .await;
                }
                ApplyOutcome::Unavailable => {
                    // These blocks already passed the parent gate, so they
                    // must not go into the by-parent map; hold them aside
                    // and retry once the service is back
                    self.paused = true;
                    self.stalled.push_back(next);
                    self.stalled.extend(queue);
                    return;
                }
            }
        }
        if applied_any {
            self.refresh_head().await;
        }
    }

    /// Re-drive blocks that were held while the chain service was down.
    /// A failure part-way through puts the remainder straight back.
    async fn retry_stalled(&mut self) {
        let stalled = std::mem::take(&mut self.stalled);
        debug!(count = stalled.len(), "retrying blocks held through chain outage");
        for block in stalled {
            if self.paused {
                self.stalled.push_back(block);
                continue;
            }
            self.ingest_block(block).await;
        }
    }

    async fn apply_one(&mut self, block: &ReadyBlock) -> ApplyOutcome {
        match self
            .chain
            .apply_block(block.block.clone(), Some(block.topology))
            .await
        {
            Ok(ApplyBlockResult::Accepted) => {
                debug!(block = %block.topology, "block applied");
                ApplyOutcome::Applied
            }
            Ok(ApplyBlockResult::AlreadyHave) => ApplyOutcome::Duplicate,
            Ok(ApplyBlockResult::Rejected(reason)) => {
                warn!(block = %block.topology, peer = %block.peer, "block rejected: {reason}");
                ApplyOutcome::Rejected
            }
            Err(ChainError::Unavailable(e)) => {
                warn!("chain service unavailable while applying: {e}");
                ApplyOutcome::Unavailable
            }
            Err(e) => {
                warn!(block = %block.topology, "apply failed: {e}");
                ApplyOutcome::Rejected
            }
        }
    }

    fn network_head(&self) -> Option<u64> {
        self.peers.values().flatten().map(|head| head.height).max()
    }

    fn caught_up_fraction(&self) -> f64 {
        if self.peers.is_empty() {
            return 0.0;
        }
        let floor = self.local_head.head.height.saturating_sub(self.lag_tolerance);
        let caught_up = self
            .peers
            .values()
            .flatten()
            .filter(|head| head.height >= floor)
            .count();
        caught_up as f64 / self.peers.len() as f64
    }

    /// Re-derive state, window and gossip toggle from what we can see
    async fn evaluate(&mut self) {
        let new_state = next_state(
            self.state,
            self.peers.len(),
            self.network_head(),
            self.local_head.head.height,
            self.config.catch_up_slack,
        );
        if new_state != self.state {
            info!(from = ?self.state, to = ?new_state, "sync state change");
            self.state = new_state;
        }

        let window = window_for(self.state, self.local_head.head.height, &self.config);
        if window != self.last_window {
            self.last_window = window;
            let _ = self.provider.send(ProviderCommand::SetWindow(window)).await;
        }

        let fraction = self.caught_up_fraction();
        if let Some(enabled) =
            self.toggle.update(fraction, self.peers.len(), Instant::now())
        {
            let command = if enabled {
                GossipCommand::Enable
            } else {
                GossipCommand::Disable
            };
            let _ = self.gossip.send(command).await;
        }
    }
}

enum ApplyOutcome {
    Applied,
    Duplicate,
    Rejected,
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> BlockId {
        BlockId::new([n; 32])
    }

    fn topology(height: u64, n: u8, prev: u8) -> BlockTopology {
        BlockTopology {
            height,
            id: id(n),
            previous: id(prev),
        }
    }

    fn ready(height: u64, n: u8, prev: u8) -> ReadyBlock {
        ReadyBlock {
            peer: PeerId::from("a"),
            topology: topology(height, n, prev),
            block: vec![n],
        }
    }

    fn config() -> SyncManagerConfig {
        SyncManagerConfig {
            catch_up_slack: 5,
            sync_window_size: 256,
            gossip_window_size: 4,
            max_pending_blocks: 2000,
        }
    }

    mod state_machine {
        use super::*;

        #[test]
        fn no_peers_means_disconnected() {
            assert_eq!(
                next_state(SyncState::Syncing, 0, Some(100), 10, 5),
                SyncState::Disconnected
            );
        }

        #[test]
        fn first_peer_starts_checking() {
            assert_eq!(
                next_state(SyncState::Disconnected, 1, None, 10, 5),
                SyncState::Checking
            );
        }

        #[test]
        fn checking_waits_for_a_sampled_head() {
            assert_eq!(
                next_state(SyncState::Checking, 3, None, 10, 5),
                SyncState::Checking
            );
        }

        #[test]
        fn checking_resolves_by_slack() {
            // within slack: caught up
            assert_eq!(
                next_state(SyncState::Checking, 3, Some(15), 10, 5),
                SyncState::Gossiping
            );
            // beyond slack: behind
            assert_eq!(
                next_state(SyncState::Checking, 3, Some(16), 10, 5),
                SyncState::Syncing
            );
        }

        #[test]
        fn syncing_and_gossiping_flip_on_slack_boundary() {
            assert_eq!(
                next_state(SyncState::Syncing, 3, Some(12), 10, 5),
                SyncState::Gossiping
            );
            assert_eq!(
                next_state(SyncState::Gossiping, 3, Some(100), 10, 5),
                SyncState::Syncing
            );
        }

        #[test]
        fn windows_follow_state() {
            let cfg = config();
            assert!(window_for(SyncState::Disconnected, 10, &cfg).is_empty());
            assert!(window_for(SyncState::Checking, 10, &cfg).is_empty());
            assert_eq!(
                window_for(SyncState::Syncing, 10, &cfg),
                HeightRange::new(11, 256)
            );
            assert_eq!(
                window_for(SyncState::Gossiping, 10, &cfg),
                HeightRange::new(11, 4)
            );
        }
    }

    mod pending_blocks {
        use super::*;

        #[test]
        fn children_wait_for_their_parent() {
            let mut pending = PendingBlocks::default();
            assert!(pending.insert(ready(6, 6, 5), 100));
            assert!(pending.insert(ready(7, 7, 6), 100));
            assert_eq!(pending.len(), 2);

            // parent 5 lands: only its direct child is released
            let released = pending.take_children(&id(5));
            assert_eq!(released.len(), 1);
            assert_eq!(released[0].topology.id, id(6));
            assert_eq!(pending.len(), 1);

            let released = pending.take_children(&id(6));
            assert_eq!(released.len(), 1);
            assert_eq!(pending.len(), 0);
        }

        #[test]
        fn duplicate_holds_are_collapsed() {
            let mut pending = PendingBlocks::default();
            assert!(pending.insert(ready(6, 6, 5), 100));
            assert!(pending.insert(ready(6, 6, 5), 100));
            assert_eq!(pending.len(), 1);
        }

        #[test]
        fn insert_respects_limit() {
            let mut pending = PendingBlocks::default();
            assert!(pending.insert(ready(6, 6, 5), 1));
            assert!(!pending.insert(ready(7, 7, 6), 1));
            assert_eq!(pending.len(), 1);
        }

        #[test]
        fn prune_drops_settled_holds() {
            let mut pending = PendingBlocks::default();
            pending.insert(ready(6, 6, 5), 100);
            pending.insert(ready(20, 20, 19), 100);

            pending.prune_below(10);
            assert_eq!(pending.len(), 1);
            assert!(pending.take_children(&id(19)).len() == 1);
        }
    }
}
