use std::time::Duration;

use anyhow::{bail, Result};
use config::Config;
use pharos_common::Checkpoint;

/// Typed view of the module configuration, layered over the embedded
/// defaults in `config.default.toml`.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    pub node: NodeConfig,
    pub sync_manager: SyncManagerConfig,
    pub bdmi: BdmiConfig,
    pub download_manager: DownloadManagerConfig,
    pub peer_handler: PeerHandlerConfig,
    pub gossip_toggle: GossipToggleConfig,
    pub blacklist: BlacklistConfig,
    pub topics: TopicsConfig,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Multiaddress the overlay host listens on; also what we advertise
    /// on the peer-exchange topic
    pub listen_addr: String,

    /// Peers dialed at startup and re-dialed whenever they drop
    pub initial_peers: Vec<String>,

    /// Peers the overlay should keep a pinned mesh link to; dialed like
    /// initial peers
    pub direct_peers: Vec<String>,

    /// Overlay identity seed, forwarded to the overlay deployment
    pub seed: String,

    pub enable_peer_exchange: bool,

    /// Bus services allowed to observe gossip traffic
    pub plugins: Vec<String>,

    /// Entries in `height:hex-id` form
    pub checkpoints: Vec<String>,

    /// Deadline for chain service RPC
    pub rpc_timeout_ms: u64,
}

impl NodeConfig {
    pub fn parsed_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.checkpoints.iter().map(|s| s.parse()).collect()
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncManagerConfig {
    /// How close to the network head counts as caught up
    pub catch_up_slack: u64,

    /// Heights requested from peers while syncing
    pub sync_window_size: u32,

    /// Heights requested from peers while gossiping, to keep short-fork
    /// awareness alive
    pub gossip_window_size: u32,

    /// Upper bound on how far above the local head we track blocks
    pub max_pending_blocks: u64,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BdmiConfig {
    /// Cadence at which the current window is re-broadcast to handlers
    pub window_broadcast_interval_ms: u64,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DownloadManagerConfig {
    pub max_concurrent_downloads_per_peer: u32,
    pub max_concurrent_downloads_total: u32,
    pub download_timeout_ms: u64,

    /// Attempts before a block is abandoned and its advertisers blamed
    pub max_download_attempts: u32,
}

impl DownloadManagerConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerHandlerConfig {
    pub height_range_poll_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub download_timeout_ms: u64,
}

impl PeerHandlerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.height_range_poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GossipToggleConfig {
    pub enable_threshold: f64,
    pub disable_threshold: f64,
    pub always_enable: bool,
    pub always_disable: bool,

    /// How far behind the local head a peer may be and still count as
    /// caught up
    pub lag_tolerance: u64,

    /// Minimum time between state changes
    pub min_toggle_interval_ms: u64,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlacklistConfig {
    /// Score above which a peer is disconnected
    pub disconnect_threshold: f64,

    /// How long a disconnected peer stays blocked
    pub cooldown_ms: u64,

    /// Period over which the score decays back to zero
    pub rolling_window_ms: u64,

    /// Per-kind score weights keyed by `PeerErrorKind::name()`;
    /// -1 means disconnect immediately
    pub weights: std::collections::HashMap<String, f64>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TopicsConfig {
    pub chain_request: String,
    pub fork_heads: String,
    pub block_accepted: String,
    pub overlay_request: String,
    pub peer_events: String,
    pub gossip_received: String,
    pub sync_service: String,
}

impl SyncConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        let cfg: Self = full_config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.gossip_toggle.always_enable && self.gossip_toggle.always_disable {
            bail!("gossip_toggle.always_enable and always_disable are mutually exclusive");
        }
        if self.gossip_toggle.disable_threshold > self.gossip_toggle.enable_threshold {
            bail!("gossip_toggle.disable_threshold must not exceed enable_threshold");
        }
        if self.download_manager.max_concurrent_downloads_per_peer == 0
            || self.download_manager.max_concurrent_downloads_total == 0
        {
            bail!("download_manager concurrency limits must be positive");
        }
        self.node.parsed_checkpoints()?;
        Ok(())
    }
}
