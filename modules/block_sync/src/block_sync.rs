//! Pharos block-sync module for Caryatid
//! Keeps the local chain service in step with the peer-to-peer network:
//! polls peers for block topology, schedules downloads across them, applies
//! blocks in chain-acceptable order and toggles gossip once caught up.

mod chain;
mod configuration;
mod download_manager;
mod gossip;
mod peer_error;
mod peer_handler;
mod peer_rpc;
mod peer_server;
mod provider;
mod supervisor;
mod sync_manager;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use caryatid_sdk::{module, Context, Module};
use config::Config;
use pharos_common::messages::Message;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chain::ChainClient;
use crate::configuration::SyncConfig;
use crate::supervisor::Supervisor;

#[module(
    message_type(Message),
    name = "block-sync",
    description = "Block download and synchronization engine"
)]
pub struct BlockSync;

impl BlockSync {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = SyncConfig::try_load(&config)?;
        info!(
            listen = %cfg.node.listen_addr,
            peers = cfg.node.initial_peers.len(),
            checkpoints = cfg.node.checkpoints.len(),
            "starting block sync"
        );
        if !cfg.node.seed.is_empty() {
            info!("overlay identity derived from configured seed");
        }
        if !cfg.node.plugins.is_empty() {
            info!(plugins = ?cfg.node.plugins, "plugin services enabled");
        }

        let chain = ChainClient::new(
            context.clone(),
            cfg.topics.chain_request.clone(),
            Duration::from_millis(cfg.node.rpc_timeout_ms),
        );

        // Serve the sync RPC to the network before consuming it ourselves
        peer_server::register(&context, &cfg.topics.sync_service, chain.clone());

        let peer_events = context.subscribe(&cfg.topics.peer_events).await?;
        let fork_heads = context.subscribe(&cfg.topics.fork_heads).await?;
        let gossip_received = context.subscribe(&cfg.topics.gossip_received).await?;
        let block_accepted = context.subscribe(&cfg.topics.block_accepted).await?;

        let supervisor = Supervisor::new(
            context.clone(),
            cfg,
            chain,
            peer_events,
            fork_heads,
            gossip_received,
            block_accepted,
            CancellationToken::new(),
        );
        context.clone().run(supervisor.run());

        Ok(())
    }
}
