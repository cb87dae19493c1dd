//! Fan-in / fan-out hub between the scheduler and the per-peer handlers.
//!
//! Owns the set of live handlers: every handler reports into the shared
//! sinks, while window updates and download requests fan out through the
//! per-peer channels held here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use caryatid_sdk::Context;
use pharos_common::messages::Message;
use pharos_common::{Checkpoint, HeightRange, PeerId};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::configuration::PeerHandlerConfig;
use crate::peer_handler::{BlockDownloadRequest, HandlerSinks, PeerHandler};
use crate::peer_rpc::PeerRpc;

/// Bound on waiting for a cancelled handler to wind down
const HANDLER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum ProviderCommand {
    AddPeer { peer: PeerId },
    RemovePeer { peer: PeerId },
    SetWindow(HeightRange),
    RequestDownload {
        peer: PeerId,
        request: BlockDownloadRequest,
    },
}

struct PeerHandlerHandle {
    window: watch::Sender<HeightRange>,
    downloads: mpsc::Sender<BlockDownloadRequest>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct BdmiProvider {
    context: Arc<Context<Message>>,
    overlay_topic: String,
    handler_config: PeerHandlerConfig,
    chain_id: Arc<Vec<u8>>,
    checkpoints: Arc<Vec<Checkpoint>>,
    sinks: HandlerSinks,
    commands: mpsc::Receiver<ProviderCommand>,
    window: HeightRange,
    rebroadcast_interval: Duration,
    peers: BTreeMap<PeerId, PeerHandlerHandle>,
    cancel: CancellationToken,
}

impl BdmiProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<Context<Message>>,
        overlay_topic: String,
        handler_config: PeerHandlerConfig,
        chain_id: Arc<Vec<u8>>,
        checkpoints: Arc<Vec<Checkpoint>>,
        sinks: HandlerSinks,
        commands: mpsc::Receiver<ProviderCommand>,
        rebroadcast_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            overlay_topic,
            handler_config,
            chain_id,
            checkpoints,
            sinks,
            commands,
            window: HeightRange::empty(),
            rebroadcast_interval,
            peers: BTreeMap::new(),
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut rebroadcast = tokio::time::interval(self.rebroadcast_interval);
        rebroadcast.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = rebroadcast.tick() => self.broadcast_window(),
            }
        }
        for (_, handle) in std::mem::take(&mut self.peers) {
            handle.cancel.cancel();
        }
    }

    fn handle_command(&mut self, command: ProviderCommand) {
        match command {
            ProviderCommand::AddPeer { peer } => self.add_peer(peer),
            ProviderCommand::RemovePeer { peer } => self.remove_peer(peer),
            ProviderCommand::SetWindow(window) => {
                self.window = window;
                self.broadcast_window();
            }
            ProviderCommand::RequestDownload { peer, request } => {
                self.request_download(peer, request)
            }
        }
    }

    fn add_peer(&mut self, peer: PeerId) {
        if self.peers.contains_key(&peer) {
            debug!(peer = %peer, "handler already running");
            return;
        }
        let (window_tx, window_rx) = watch::channel(self.window);
        // Capacity 1: the scheduler feels backpressure from a slow handler
        let (download_tx, download_rx) = mpsc::channel(1);
        let cancel = self.cancel.child_token();
        let rpc = PeerRpc::new(self.context.clone(), self.overlay_topic.clone(), peer.clone());
        let handler = PeerHandler::new(
            peer.clone(),
            rpc,
            self.chain_id.clone(),
            self.checkpoints.clone(),
            self.handler_config.clone(),
            window_rx,
            download_rx,
            self.sinks.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(handler.run());
        self.peers.insert(
            peer,
            PeerHandlerHandle {
                window: window_tx,
                downloads: download_tx,
                cancel,
                task,
            },
        );
    }

    fn remove_peer(&mut self, peer: PeerId) {
        let Some(handle) = self.peers.remove(&peer) else {
            return;
        };
        handle.cancel.cancel();
        let abort = handle.task.abort_handle();
        tokio::spawn(async move {
            if tokio::time::timeout(HANDLER_DRAIN_TIMEOUT, handle.task).await.is_err() {
                warn!(peer = %peer, "handler did not drain in time, aborting");
                abort.abort();
            }
        });
    }

    fn broadcast_window(&mut self) {
        for handle in self.peers.values() {
            handle.window.send_replace(self.window);
        }
    }

    /// Hand a download to exactly one handler. The per-handler channel only
    /// holds one request, so the send happens off this task.
    fn request_download(&mut self, peer: PeerId, request: BlockDownloadRequest) {
        let Some(handle) = self.peers.get(&peer) else {
            // Scheduled against a peer that disconnected in the meantime;
            // the disconnect sweep returns the entry to the pool
            debug!(peer = %peer, block = %request.topology, "download for unknown peer dropped");
            return;
        };
        let downloads = handle.downloads.clone();
        let cancel = handle.cancel.clone();
        tokio::spawn(async move {
            select! {
                _ = cancel.cancelled() => {}
                _ = downloads.send(request) => {}
            }
        });
    }
}
