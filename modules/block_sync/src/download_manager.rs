//! The download scheduler: block inventory, peer selection, retries.
//!
//! All inventory state lives inside this actor's task and is never shared.
//! `DownloadState` is the pure state machine; `DownloadManager` is the
//! channel plumbing around it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pharos_common::{BlockId, BlockTopology, Checkpoint, LocalHead, PeerErrorKind, PeerId};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::configuration::DownloadManagerConfig;
use crate::peer_handler::{
    BlockDownloadRequest, BlockDownloadResponse, PeerError, PeerHasBlock,
};
use crate::provider::ProviderCommand;

/// Applied entries are kept this far below last-irreversible before pruning,
/// so late re-advertisements still deduplicate
const PRUNE_WINDOW: u64 = 60;

/// Resolution of the deadline sweep over in-flight downloads
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A downloaded block on its way to the apply pipeline
#[derive(Debug, Clone)]
pub struct ReadyBlock {
    pub peer: PeerId,
    pub topology: BlockTopology,
    pub block: Vec<u8>,
}

#[derive(Debug)]
pub enum DownloadCommand {
    HeadChanged(LocalHead),
    PeerDisconnected(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    /// Known to exist on some peers, not yet requested
    Advertised,

    /// Requested from exactly one peer
    Downloading { peer: PeerId, deadline: Instant },

    /// Fetched and handed over for apply; kept for deduplication
    Downloaded,
}

#[derive(Debug)]
struct BlockEntry {
    topology: BlockTopology,
    known_on: BTreeSet<PeerId>,
    state: EntryState,
    attempts: u32,
    first_seen: Instant,
}

/// Inventory plus scheduling decisions, kept free of I/O for testing
pub struct DownloadState {
    config: DownloadManagerConfig,
    checkpoints: Arc<Vec<Checkpoint>>,
    max_pending_blocks: u64,
    head: LocalHead,

    /// Keyed by `(height, id)` so iteration is the scheduling order
    inventory: BTreeMap<(u64, BlockId), BlockEntry>,
    inflight: HashMap<PeerId, u32>,
    inflight_total: u32,
    ready: VecDeque<ReadyBlock>,
}

impl DownloadState {
    pub fn new(
        config: DownloadManagerConfig,
        checkpoints: Arc<Vec<Checkpoint>>,
        max_pending_blocks: u64,
    ) -> Self {
        Self {
            config,
            checkpoints,
            max_pending_blocks,
            head: LocalHead::default(),
            inventory: BTreeMap::new(),
            inflight: HashMap::new(),
            inflight_total: 0,
            ready: VecDeque::new(),
        }
    }

    /// Record that `peer` advertises `topology`. Returns a blame when the
    /// advertisement contradicts a configured checkpoint.
    pub fn handle_peer_has_block(
        &mut self,
        peer: PeerId,
        topology: BlockTopology,
        now: Instant,
    ) -> Option<PeerErrorKind> {
        if topology.height <= self.head.last_irreversible.height {
            return None; // already settled
        }
        if topology.height > self.head.head.height + self.max_pending_blocks {
            trace!(block = %topology, "advertisement beyond pending window");
            return None;
        }
        if let Some(cp) = self.checkpoints.iter().find(|cp| cp.height == topology.height) {
            if cp.id != topology.id {
                return Some(PeerErrorKind::CheckpointMismatch);
            }
        }

        self.inventory
            .entry((topology.height, topology.id))
            .or_insert_with(|| BlockEntry {
                topology,
                known_on: BTreeSet::new(),
                state: EntryState::Advertised,
                attempts: 0,
                first_seen: now,
            })
            .known_on
            .insert(peer);
        None
    }

    /// One scheduling pass: pick advertised entries in `(height, id)` order
    /// and assign each to its least-loaded advertiser, bounded by the
    /// per-peer and global in-flight limits.
    pub fn schedule(&mut self, now: Instant) -> Vec<(PeerId, BlockTopology)> {
        let per_peer = self.config.max_concurrent_downloads_per_peer;
        let total = self.config.max_concurrent_downloads_total;
        let mut dispatches = Vec::new();

        if self.inflight_total >= total {
            return dispatches;
        }

        let candidates: Vec<(u64, BlockId)> = self
            .inventory
            .iter()
            .filter(|(_, e)| e.state == EntryState::Advertised)
            .map(|(key, _)| *key)
            .collect();

        for key in candidates {
            if self.inflight_total >= total {
                break;
            }
            let entry = self.inventory.get_mut(&key).expect("candidate vanished");
            let chosen = entry
                .known_on
                .iter()
                .map(|p| (*self.inflight.get(p).unwrap_or(&0), p))
                .filter(|(load, _)| *load < per_peer)
                .min()
                .map(|(_, p)| p.clone());
            let Some(peer) = chosen else {
                continue; // every advertiser is saturated
            };
            entry.state = EntryState::Downloading {
                peer: peer.clone(),
                deadline: now + self.config.download_timeout(),
            };
            *self.inflight.entry(peer.clone()).or_insert(0) += 1;
            self.inflight_total += 1;
            dispatches.push((peer, entry.topology));
        }
        dispatches
    }

    pub fn handle_response(
        &mut self,
        response: BlockDownloadResponse,
    ) -> Vec<PeerError> {
        let BlockDownloadResponse {
            peer,
            topology,
            result,
        } = response;
        let key = (topology.height, topology.id);
        if !self.inventory.contains_key(&key) {
            return Vec::new(); // pruned or abandoned while in flight
        }

        match result {
            Ok(bytes) if !bytes.is_empty() => {
                self.complete_download(key, peer, bytes);
                Vec::new()
            }
            Ok(_) => self.fail_download(key, peer, PeerErrorKind::ResponseEmpty),
            Err(kind) => self.fail_download(key, peer, kind),
        }
    }

    /// Revisit in-flight downloads past their deadline; each expiry is
    /// handled exactly like a failed response.
    pub fn handle_timeouts(&mut self, now: Instant) -> Vec<PeerError> {
        let expired: Vec<((u64, BlockId), PeerId)> = self
            .inventory
            .iter()
            .filter_map(|(key, e)| match &e.state {
                EntryState::Downloading { peer, deadline } if *deadline <= now => {
                    Some((*key, peer.clone()))
                }
                _ => None,
            })
            .collect();

        let mut blames = Vec::new();
        for (key, peer) in expired {
            blames.extend(self.fail_download(key, peer, PeerErrorKind::Timeout));
        }
        blames
    }

    /// Forget everything a departed peer advertised; its in-flight download
    /// goes back to the pool for the remaining advertisers.
    pub fn handle_peer_disconnected(&mut self, peer: &PeerId) {
        let mut emptied = Vec::new();
        for (key, entry) in self.inventory.iter_mut() {
            if let EntryState::Downloading { peer: assigned, .. } = &entry.state {
                if assigned == peer {
                    entry.state = EntryState::Advertised;
                    self.inflight_total = self.inflight_total.saturating_sub(1);
                }
            }
            entry.known_on.remove(peer);
            if entry.known_on.is_empty() && entry.state == EntryState::Advertised {
                emptied.push(*key);
            }
        }
        for key in emptied {
            self.inventory.remove(&key);
        }
        self.inflight.remove(peer);
    }

    pub fn set_head(&mut self, head: LocalHead) {
        self.head = head;
        let cutoff = self.head.last_irreversible.height.saturating_sub(PRUNE_WINDOW);
        if cutoff == 0 {
            return;
        }
        let keep = self.inventory.split_off(&(cutoff, BlockId::default()));
        for (_, entry) in std::mem::replace(&mut self.inventory, keep) {
            if let EntryState::Downloading { peer, .. } = entry.state {
                self.decrement(&peer);
            }
        }
    }

    pub fn pop_ready(&mut self) -> Option<ReadyBlock> {
        self.ready.pop_front()
    }

    pub fn push_ready_front(&mut self, block: ReadyBlock) {
        self.ready.push_front(block);
    }

    fn complete_download(&mut self, key: (u64, BlockId), source: PeerId, bytes: Vec<u8>) {
        let entry = self.inventory.get_mut(&key).expect("entry vanished");
        match entry.state.clone() {
            EntryState::Downloaded => {} // duplicate delivery
            EntryState::Downloading { peer, .. } => {
                // Usually our own assignment completing; a late answer from
                // a previously timed-out peer also counts
                self.decrement(&peer);
                let entry = self.inventory.get_mut(&key).expect("entry vanished");
                entry.state = EntryState::Downloaded;
                self.ready.push_back(ReadyBlock {
                    peer: source,
                    topology: entry.topology,
                    block: bytes,
                });
            }
            EntryState::Advertised => {
                entry.state = EntryState::Downloaded;
                self.ready.push_back(ReadyBlock {
                    peer: source,
                    topology: entry.topology,
                    block: bytes,
                });
            }
        }
    }

    fn fail_download(
        &mut self,
        key: (u64, BlockId),
        peer: PeerId,
        kind: PeerErrorKind,
    ) -> Vec<PeerError> {
        let entry = self.inventory.get_mut(&key).expect("entry vanished");
        let was_assigned =
            matches!(&entry.state, EntryState::Downloading { peer: p, .. } if *p == peer);
        if !was_assigned {
            return Vec::new(); // stale failure, the deadline sweep got there first
        }
        self.decrement(&peer);
        let entry = self.inventory.get_mut(&key).expect("entry vanished");
        entry.attempts += 1;
        entry.known_on.remove(&peer);
        let mut blames = vec![PeerError {
            peer,
            kind,
        }];

        if entry.attempts >= self.config.max_download_attempts || entry.known_on.is_empty() {
            debug!(
                block = %entry.topology,
                attempts = entry.attempts,
                age = ?entry.first_seen.elapsed(),
                "abandoning block download"
            );
            blames.extend(entry.known_on.iter().map(|p| PeerError {
                peer: p.clone(),
                kind: PeerErrorKind::MaxAttemptsExceeded,
            }));
            self.inventory.remove(&key);
        } else {
            entry.state = EntryState::Advertised;
        }
        blames
    }

    fn decrement(&mut self, peer: &PeerId) {
        if let Some(count) = self.inflight.get_mut(peer) {
            *count = count.saturating_sub(1);
        }
        self.inflight_total = self.inflight_total.saturating_sub(1);
    }

    #[cfg(test)]
    fn inflight_for(&self, peer: &PeerId) -> u32 {
        *self.inflight.get(peer).unwrap_or(&0)
    }

    #[cfg(test)]
    fn entry_state(&self, topology: &BlockTopology) -> Option<&EntryState> {
        self.inventory.get(&(topology.height, topology.id)).map(|e| &e.state)
    }
}

pub struct DownloadManager {
    state: DownloadState,
    has_block: mpsc::Receiver<PeerHasBlock>,
    responses: mpsc::Receiver<BlockDownloadResponse>,
    commands: mpsc::Receiver<DownloadCommand>,
    provider: mpsc::Sender<ProviderCommand>,
    ready: mpsc::Sender<ReadyBlock>,
    errors: mpsc::Sender<PeerError>,
    cancel: CancellationToken,
}

impl DownloadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: DownloadState,
        has_block: mpsc::Receiver<PeerHasBlock>,
        responses: mpsc::Receiver<BlockDownloadResponse>,
        commands: mpsc::Receiver<DownloadCommand>,
        provider: mpsc::Sender<ProviderCommand>,
        ready: mpsc::Sender<ReadyBlock>,
        errors: mpsc::Sender<PeerError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state,
            has_block,
            responses,
            commands,
            provider,
            ready,
            errors,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let mut blames = Vec::new();
            select! {
                _ = self.cancel.cancelled() => return,
                event = self.has_block.recv() => {
                    let Some(PeerHasBlock { peer, topology }) = event else { return };
                    if let Some(kind) = self.state.handle_peer_has_block(
                        peer.clone(), topology, Instant::now(),
                    ) {
                        warn!(peer = %peer, block = %topology, "rejected advertisement: {kind}");
                        blames.push(PeerError { peer, kind });
                    }
                }
                response = self.responses.recv() => {
                    let Some(response) = response else { return };
                    blames.extend(self.state.handle_response(response));
                }
                command = self.commands.recv() => {
                    match command {
                        Some(DownloadCommand::HeadChanged(head)) => self.state.set_head(head),
                        Some(DownloadCommand::PeerDisconnected(peer)) => {
                            self.state.handle_peer_disconnected(&peer)
                        }
                        None => return,
                    }
                }
                _ = sweep.tick() => {
                    blames.extend(self.state.handle_timeouts(Instant::now()));
                }
            }
            for blame in blames {
                if self.errors.send(blame).await.is_err() {
                    return;
                }
            }
            self.flush_ready();
            for (peer, topology) in self.state.schedule(Instant::now()) {
                let command = ProviderCommand::RequestDownload {
                    peer,
                    request: BlockDownloadRequest { topology },
                };
                if self.provider.send(command).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Move completed blocks toward the apply pipeline without ever blocking
    /// this task; whatever doesn't fit goes out on a later pass.
    fn flush_ready(&mut self) {
        while let Some(block) = self.state.pop_ready() {
            if let Err(e) = self.ready.try_send(block) {
                match e {
                    mpsc::error::TrySendError::Full(block) => {
                        self.state.push_ready_front(block);
                    }
                    mpsc::error::TrySendError::Closed(_) => {}
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> BlockId {
        BlockId::new([n; 32])
    }

    fn topology(height: u64, n: u8) -> BlockTopology {
        BlockTopology {
            height,
            id: id(n),
            previous: id(n.wrapping_sub(1)),
        }
    }

    fn peer(name: &str) -> PeerId {
        PeerId::from(name)
    }

    fn config() -> DownloadManagerConfig {
        DownloadManagerConfig {
            max_concurrent_downloads_per_peer: 2,
            max_concurrent_downloads_total: 4,
            download_timeout_ms: 10_000,
            max_download_attempts: 3,
        }
    }

    fn state() -> DownloadState {
        DownloadState::new(config(), Arc::new(Vec::new()), 2000)
    }

    fn state_with_checkpoints(checkpoints: Vec<Checkpoint>) -> DownloadState {
        DownloadState::new(config(), Arc::new(checkpoints), 2000)
    }

    fn advertise(state: &mut DownloadState, peer_name: &str, t: BlockTopology) {
        assert_eq!(
            state.handle_peer_has_block(peer(peer_name), t, Instant::now()),
            None
        );
    }

    fn ok_response(p: &str, t: BlockTopology) -> BlockDownloadResponse {
        BlockDownloadResponse {
            peer: peer(p),
            topology: t,
            result: Ok(vec![0xb0]),
        }
    }

    #[test]
    fn schedules_lowest_heights_first() {
        let mut state = state();
        let now = Instant::now();
        advertise(&mut state, "a", topology(3, 3));
        advertise(&mut state, "a", topology(1, 1));
        advertise(&mut state, "a", topology(2, 2));

        let dispatches = state.schedule(now);
        let heights: Vec<u64> = dispatches.iter().map(|(_, t)| t.height).collect();
        assert_eq!(heights, vec![1, 2]); // per-peer limit stops the third
    }

    #[test]
    fn balances_load_across_advertisers() {
        let mut state = state();
        let now = Instant::now();
        for n in 1..=4 {
            advertise(&mut state, "a", topology(n as u64, n));
            advertise(&mut state, "b", topology(n as u64, n));
        }

        let dispatches = state.schedule(now);
        assert_eq!(dispatches.len(), 4);
        assert_eq!(state.inflight_for(&peer("a")), 2);
        assert_eq!(state.inflight_for(&peer("b")), 2);
    }

    #[test]
    fn breaks_load_ties_by_peer_id() {
        let mut state = state();
        advertise(&mut state, "b", topology(1, 1));
        advertise(&mut state, "a", topology(1, 1));

        let dispatches = state.schedule(Instant::now());
        assert_eq!(dispatches, vec![(peer("a"), topology(1, 1))]);
    }

    #[test]
    fn never_exceeds_total_limit() {
        let mut state = state();
        for n in 1..=10 {
            advertise(&mut state, "a", topology(n as u64, n));
            advertise(&mut state, "b", topology(n as u64, n));
            advertise(&mut state, "c", topology(n as u64, n));
        }

        let dispatches = state.schedule(Instant::now());
        assert_eq!(dispatches.len(), 4);
        assert_eq!(state.inflight_total, 4);

        // nothing more until something completes
        assert!(state.schedule(Instant::now()).is_empty());
    }

    #[test]
    fn at_most_one_download_per_block() {
        let mut state = state();
        advertise(&mut state, "a", topology(1, 1));
        advertise(&mut state, "b", topology(1, 1));

        let first = state.schedule(Instant::now());
        assert_eq!(first.len(), 1);
        assert!(state.schedule(Instant::now()).is_empty());
    }

    #[test]
    fn ingest_rejects_settled_and_far_future_heights() {
        let mut state = state();
        let mut head = LocalHead::default();
        head.last_irreversible = topology(10, 1);
        head.head = topology(12, 2);
        state.set_head(head);

        advertise(&mut state, "a", topology(9, 9)); // below irreversible
        advertise(&mut state, "a", topology(10, 10)); // at irreversible
        advertise(&mut state, "a", topology(5000, 50)); // beyond window
        assert!(state.schedule(Instant::now()).is_empty());

        advertise(&mut state, "a", topology(13, 13));
        assert_eq!(state.schedule(Instant::now()).len(), 1);
    }

    #[test]
    fn ingest_blames_checkpoint_disagreement() {
        let mut state = state_with_checkpoints(vec![Checkpoint {
            height: 50,
            id: id(0xaa),
        }]);

        let good = BlockTopology {
            height: 50,
            id: id(0xaa),
            previous: id(0),
        };
        let bad = BlockTopology {
            height: 50,
            id: id(0xbb),
            previous: id(0),
        };
        assert_eq!(
            state.handle_peer_has_block(peer("a"), good, Instant::now()),
            None
        );
        assert_eq!(
            state.handle_peer_has_block(peer("b"), bad, Instant::now()),
            Some(PeerErrorKind::CheckpointMismatch)
        );
        // the disagreeing block never entered the inventory
        assert!(state.entry_state(&bad).is_none());
    }

    #[test]
    fn success_delivers_block_and_frees_slot() {
        let mut state = state();
        let t = topology(1, 1);
        advertise(&mut state, "a", t);
        let dispatches = state.schedule(Instant::now());
        assert_eq!(dispatches.len(), 1);

        let blames = state.handle_response(ok_response("a", t));
        assert!(blames.is_empty());
        assert_eq!(state.inflight_total, 0);
        assert_eq!(state.entry_state(&t), Some(&EntryState::Downloaded));

        let ready = state.pop_ready().unwrap();
        assert_eq!(ready.topology, t);
        assert_eq!(ready.block, vec![0xb0]);
    }

    #[test]
    fn empty_response_blames_and_falls_back() {
        let mut state = state();
        let t = topology(1, 1);
        advertise(&mut state, "a", t);
        advertise(&mut state, "b", t);
        assert_eq!(state.schedule(Instant::now()), vec![(peer("a"), t)]);

        let blames = state.handle_response(BlockDownloadResponse {
            peer: peer("a"),
            topology: t,
            result: Ok(vec![]),
        });
        assert_eq!(
            blames,
            vec![PeerError {
                peer: peer("a"),
                kind: PeerErrorKind::ResponseEmpty,
            }]
        );

        // next pass retries from the remaining advertiser
        assert_eq!(state.schedule(Instant::now()), vec![(peer("b"), t)]);
    }

    #[test]
    fn timeout_falls_back_to_other_peer() {
        let mut state = state();
        let now = Instant::now();
        let t = topology(1, 1);
        advertise(&mut state, "a", t);
        advertise(&mut state, "b", t);
        assert_eq!(state.schedule(now), vec![(peer("a"), t)]);

        // nothing expires before the deadline
        assert!(state.handle_timeouts(now + Duration::from_secs(9)).is_empty());

        let blames = state.handle_timeouts(now + Duration::from_secs(11));
        assert_eq!(
            blames,
            vec![PeerError {
                peer: peer("a"),
                kind: PeerErrorKind::Timeout,
            }]
        );
        assert_eq!(state.inflight_total, 0);
        assert_eq!(
            state.schedule(now + Duration::from_secs(11)),
            vec![(peer("b"), t)]
        );
    }

    #[test]
    fn late_response_after_timeout_is_not_double_counted() {
        let mut state = state();
        let now = Instant::now();
        let t = topology(1, 1);
        advertise(&mut state, "a", t);
        advertise(&mut state, "b", t);
        state.schedule(now);
        state.handle_timeouts(now + Duration::from_secs(11));

        // a's response finally arrives; its failure was already accounted
        let blames = state.handle_response(BlockDownloadResponse {
            peer: peer("a"),
            topology: t,
            result: Err(PeerErrorKind::Timeout),
        });
        assert!(blames.is_empty());
        assert_eq!(state.inflight_total, 0);
    }

    #[test]
    fn late_bytes_after_timeout_still_deliver() {
        let mut state = state();
        let now = Instant::now();
        let t = topology(1, 1);
        advertise(&mut state, "a", t);
        advertise(&mut state, "b", t);
        state.schedule(now);
        state.handle_timeouts(now + Duration::from_secs(11));

        let blames = state.handle_response(ok_response("a", t));
        assert!(blames.is_empty());
        assert_eq!(state.entry_state(&t), Some(&EntryState::Downloaded));
        assert!(state.pop_ready().is_some());
    }

    #[test]
    fn exhausted_attempts_drop_entry_and_blame_advertisers() {
        let mut state = state();
        let t = topology(1, 1);
        for p in ["a", "b", "c", "d"] {
            advertise(&mut state, p, t);
        }

        for expected in ["a", "b"] {
            let dispatches = state.schedule(Instant::now());
            assert_eq!(dispatches[0].0, peer(expected));
            state.handle_response(BlockDownloadResponse {
                peer: peer(expected),
                topology: t,
                result: Err(PeerErrorKind::RpcError),
            });
        }

        // third failure exhausts max_download_attempts
        assert_eq!(state.schedule(Instant::now())[0].0, peer("c"));
        let blames = state.handle_response(BlockDownloadResponse {
            peer: peer("c"),
            topology: t,
            result: Err(PeerErrorKind::RpcError),
        });
        assert!(blames.contains(&PeerError {
            peer: peer("c"),
            kind: PeerErrorKind::RpcError,
        }));
        assert!(blames.contains(&PeerError {
            peer: peer("d"),
            kind: PeerErrorKind::MaxAttemptsExceeded,
        }));
        assert!(state.entry_state(&t).is_none());
        assert!(state.schedule(Instant::now()).is_empty());
    }

    #[test]
    fn disconnect_drops_sole_advertiser_entries() {
        let mut state = state();
        let t = topology(1, 1);
        advertise(&mut state, "a", t);
        assert_eq!(state.schedule(Instant::now()), vec![(peer("a"), t)]);

        state.handle_peer_disconnected(&peer("a"));

        assert!(state.entry_state(&t).is_none());
        assert_eq!(state.inflight_for(&peer("a")), 0);
        assert_eq!(state.inflight_total, 0);
        assert!(state.schedule(Instant::now()).is_empty());
    }

    #[test]
    fn disconnect_returns_inflight_download_to_remaining_advertiser() {
        let mut state = state();
        let t = topology(1, 1);
        advertise(&mut state, "a", t);
        advertise(&mut state, "b", t);
        // tie on load, so the smaller peer id gets the download
        assert_eq!(state.schedule(Instant::now()), vec![(peer("a"), t)]);

        state.handle_peer_disconnected(&peer("a"));

        assert_eq!(state.entry_state(&t), Some(&EntryState::Advertised));
        assert_eq!(state.schedule(Instant::now()), vec![(peer("b"), t)]);
    }

    #[test]
    fn prune_drops_entries_below_irreversible_window() {
        let mut state = state();
        advertise(&mut state, "a", topology(100, 1));
        advertise(&mut state, "a", topology(300, 3));

        let mut head = LocalHead::default();
        head.last_irreversible = topology(200, 2);
        head.head = topology(250, 25);
        state.set_head(head);

        assert!(state.entry_state(&topology(100, 1)).is_none());
        assert_eq!(
            state.entry_state(&topology(300, 3)),
            Some(&EntryState::Advertised)
        );
    }
}
