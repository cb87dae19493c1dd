//! Per-peer actor: handshake, topology polling and the download service.
//!
//! A handler never decides to disconnect its peer; everything suspicious is
//! reported on the shared error channel and the blacklist makes the call.

use std::sync::Arc;

use pharos_common::{BlockTopology, Checkpoint, HeightRange, PeerErrorKind, PeerId};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configuration::PeerHandlerConfig;
use crate::peer_rpc::PeerRpc;

/// A peer advertised a block in our window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHasBlock {
    pub peer: PeerId,
    pub topology: BlockTopology,
}

/// Fresh head observation for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHeadUpdate {
    pub peer: PeerId,
    pub head: BlockTopology,
}

/// Ask the owning handler to download one block from its peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDownloadRequest {
    pub topology: BlockTopology,
}

/// Outcome of a download attempt; empty bytes mean the peer answered but
/// did not have the block
#[derive(Debug, Clone)]
pub struct BlockDownloadResponse {
    pub peer: PeerId,
    pub topology: BlockTopology,
    pub result: Result<Vec<u8>, PeerErrorKind>,
}

/// A peer misbehaved or failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerError {
    pub peer: PeerId,
    pub kind: PeerErrorKind,
}

/// The common sinks every handler reports into
#[derive(Clone)]
pub struct HandlerSinks {
    pub has_block: mpsc::Sender<PeerHasBlock>,
    pub heads: mpsc::Sender<PeerHeadUpdate>,
    pub responses: mpsc::Sender<BlockDownloadResponse>,
    pub errors: mpsc::Sender<PeerError>,
}

pub struct PeerHandler {
    peer: PeerId,
    rpc: PeerRpc,
    chain_id: Arc<Vec<u8>>,
    checkpoints: Arc<Vec<Checkpoint>>,
    config: PeerHandlerConfig,
    window: watch::Receiver<HeightRange>,
    download_requests: mpsc::Receiver<BlockDownloadRequest>,
    sinks: HandlerSinks,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

enum HandshakeFailure {
    /// Worth retrying: the peer may just be slow
    Transient(PeerErrorKind),

    /// The peer is on the wrong chain or the wrong fork; give up
    Fatal(PeerErrorKind),
}

impl PeerHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: PeerId,
        rpc: PeerRpc,
        chain_id: Arc<Vec<u8>>,
        checkpoints: Arc<Vec<Checkpoint>>,
        config: PeerHandlerConfig,
        window: watch::Receiver<HeightRange>,
        download_requests: mpsc::Receiver<BlockDownloadRequest>,
        sinks: HandlerSinks,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer,
            rpc,
            chain_id,
            checkpoints,
            config,
            window,
            download_requests,
            sinks,
            cancel,
            workers: JoinSet::new(),
        }
    }

    pub async fn run(mut self) {
        debug!(peer = %self.peer, "peer handler starting");
        if self.handshake().await.is_ok() {
            self.poll_loop().await;
        }
        // Cancellation fans out to any in-flight download workers
        self.cancel.cancel();
        while self.workers.join_next().await.is_some() {}
        debug!(peer = %self.peer, "peer handler stopped");
    }

    /// Verify the peer is on our chain and agrees with every checkpoint it
    /// has reached. Transient RPC failures are retried at poll cadence.
    async fn handshake(&mut self) -> Result<(), ()> {
        loop {
            match self.try_handshake().await {
                Ok(()) => {
                    info!(peer = %self.peer, "peer handshake complete");
                    return Ok(());
                }
                Err(HandshakeFailure::Fatal(kind)) => {
                    warn!(peer = %self.peer, error = %kind, "peer rejected at handshake");
                    self.report(kind).await;
                    return Err(());
                }
                Err(HandshakeFailure::Transient(kind)) => {
                    debug!(peer = %self.peer, error = %kind, "handshake attempt failed");
                    self.report(kind).await;
                }
            }
            select! {
                _ = self.cancel.cancelled() => return Err(()),
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }

    async fn try_handshake(&mut self) -> Result<(), HandshakeFailure> {
        let timeout = self.config.rpc_timeout();

        let their_chain = self
            .rpc
            .get_chain_id(timeout)
            .await
            .map_err(|e| HandshakeFailure::Transient(e.kind()))?;
        if their_chain != *self.chain_id {
            return Err(HandshakeFailure::Fatal(PeerErrorKind::WrongChain));
        }

        let head = self
            .rpc
            .get_head(timeout)
            .await
            .map_err(|e| HandshakeFailure::Transient(e.kind()))?;

        let heights: Vec<u64> = self
            .checkpoints
            .iter()
            .filter(|cp| cp.height <= head.height)
            .map(|cp| cp.height)
            .collect();
        if !heights.is_empty() {
            let ancestors = self
                .rpc
                .get_ancestor_topology(head.id, heights, timeout)
                .await
                .map_err(|e| HandshakeFailure::Transient(e.kind()))?;
            for cp in self.checkpoints.iter().filter(|cp| cp.height <= head.height) {
                let agrees = ancestors
                    .iter()
                    .any(|a| a.height == cp.height && a.id == cp.id);
                if !agrees {
                    return Err(HandshakeFailure::Fatal(PeerErrorKind::CheckpointMismatch));
                }
            }
        }

        let _ = self.sinks.heads.send(PeerHeadUpdate {
            peer: self.peer.clone(),
            head,
        })
        .await;
        Ok(())
    }

    async fn poll_loop(&mut self) {
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.cancel.cancelled() => return,
                _ = poll.tick() => {
                    if self.poll_cycle().await.is_err() {
                        return;
                    }
                }
                req = self.download_requests.recv() => {
                    match req {
                        Some(req) => self.start_download(req),
                        None => return,
                    }
                }
            }
        }
    }

    /// One topology poll: refresh the peer's head, then ask for everything
    /// it has inside the current window. The window value is read at poll
    /// time, so of several updates between polls only the latest matters.
    async fn poll_cycle(&mut self) -> Result<(), ()> {
        let timeout = self.config.rpc_timeout();

        match self.rpc.get_head(timeout).await {
            Ok(head) => {
                self.forward_heads(head).await?;
            }
            Err(e) => {
                self.report(e.kind()).await;
                return Ok(());
            }
        }

        let window = *self.window.borrow();
        if window.is_empty() {
            return Ok(());
        }

        match self.rpc.get_topology_at_height(window, timeout).await {
            Ok(topologies) => {
                for topology in topologies {
                    if !window.contains(topology.height) {
                        self.report(PeerErrorKind::TopologyOutOfWindow).await;
                        continue;
                    }
                    let event = PeerHasBlock {
                        peer: self.peer.clone(),
                        topology,
                    };
                    select! {
                        _ = self.cancel.cancelled() => return Err(()),
                        sent = self.sinks.has_block.send(event) => {
                            if sent.is_err() {
                                return Err(());
                            }
                        }
                    }
                }
            }
            Err(e) => self.report(e.kind()).await,
        }
        Ok(())
    }

    async fn forward_heads(&mut self, head: BlockTopology) -> Result<(), ()> {
        let event = PeerHeadUpdate {
            peer: self.peer.clone(),
            head,
        };
        select! {
            _ = self.cancel.cancelled() => Err(()),
            sent = self.sinks.heads.send(event) => sent.map_err(|_| ()),
        }
    }

    /// Fetch one block in a worker task; concurrency is bounded upstream by
    /// the scheduler's per-peer in-flight limit.
    fn start_download(&mut self, request: BlockDownloadRequest) {
        let rpc = self.rpc.clone();
        let peer = self.peer.clone();
        let responses = self.sinks.responses.clone();
        let timeout = self.config.download_timeout();
        let cancel = self.cancel.clone();
        self.workers.spawn(async move {
            let topology = request.topology;
            debug!(peer = %peer, block = %topology, "downloading block");
            let ids = [topology.id];
            let outcome = select! {
                _ = cancel.cancelled() => return,
                result = rpc.get_blocks_by_id(&ids, timeout) => result,
            };
            let result = match outcome {
                Ok(blocks) => Ok(blocks.into_iter().next().unwrap_or_default()),
                Err(e) => {
                    debug!(peer = %peer, block = %topology, "download failed: {e}");
                    Err(e.kind())
                }
            };
            let response = BlockDownloadResponse {
                peer,
                topology,
                result,
            };
            select! {
                _ = cancel.cancelled() => {}
                _ = responses.send(response) => {}
            }
        });
    }

    async fn report(&self, kind: PeerErrorKind) {
        let error = PeerError {
            peer: self.peer.clone(),
            kind,
        };
        select! {
            _ = self.cancel.cancelled() => {}
            _ = self.sinks.errors.send(error) => {}
        }
    }
}
