//! Definition of Pharos bus messages
//!
//! Everything the sync engine says to the chain service and the overlay
//! host, and everything they say back, travels as one of these. Topics are
//! configurable; the defaults live in the block-sync module configuration.

// We don't use these messages in the pharos_common crate itself
#![allow(dead_code)]

use crate::hash::BlockId;
use crate::types::{
    ApplyBlockResult, ApplyTxResult, BlockTopology, HeightRange, LocalHead, PeerId,
};

// === Chain service RPC ===

/// Request to the chain/block-store service
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ChainRequest {
    /// Current head, last-irreversible and fork heads
    GetHeadInfo,

    /// Submit a block for validation and application
    ApplyBlock(ApplyBlockMessage),

    /// Submit a gossiped transaction
    ApplyTransaction(ApplyTransactionMessage),

    /// Ancestors of `block_id` at each requested height
    GetAncestorTopology {
        block_id: BlockId,
        heights: Vec<u64>,
    },

    /// Identity of the chain this node serves
    GetChainId,

    /// Block bytes by id, from the block store
    GetBlocks { ids: Vec<BlockId> },
}

/// Block submission payload
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApplyBlockMessage {
    /// Opaque block bytes
    pub block: Vec<u8>,

    /// Identity of the block, when the sender knows it
    pub topology: Option<BlockTopology>,
}

/// Transaction submission payload
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApplyTransactionMessage {
    /// Opaque transaction bytes
    pub tx: Vec<u8>,
}

/// Response from the chain/block-store service
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ChainResponse {
    HeadInfo(LocalHead),
    BlockApplied(ApplyBlockResult),
    TransactionApplied(ApplyTxResult),
    AncestorTopology(Vec<BlockTopology>),
    ChainId(Vec<u8>),

    /// Same order as the request; an empty entry means "not stored"
    Blocks(Vec<Vec<u8>>),

    /// Requested block id is not on the local chain
    NotOnChain,

    /// Service-side failure, described for the log
    Error(String),
}

/// Broadcast from the chain service whenever its head set changes
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ForkHeadsMessage {
    pub head_info: LocalHead,
}

/// Broadcast from the chain service when a block is accepted, carrying the
/// bytes so the network side can gossip it onward
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAcceptedMessage {
    pub topology: BlockTopology,
    pub block: Vec<u8>,

    /// True when this node produced the block (gossip it even mid-sync)
    pub own: bool,
}

// === Overlay host contract ===

/// Peer lifecycle events published by the overlay host
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PeerEventMessage {
    Connected { peer: PeerId, address: String },
    Disconnected { peer: PeerId },
}

/// Request to the overlay host
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum OverlayRequest {
    /// Open a connection to the given multiaddress
    Dial { address: String },

    /// Drop the connection to a peer
    Disconnect { peer: PeerId },

    /// Forward an RPC to a connected peer; `deadline_ms` bounds the
    /// round trip as observed by the overlay
    PeerRpc {
        peer: PeerId,
        deadline_ms: u64,
        request: PeerRpcRequest,
    },

    /// Join or leave a gossip topic mesh
    SetGossipSubscription { topic: String, subscribed: bool },

    /// Publish bytes on a gossip topic
    PublishGossip { topic: String, data: Vec<u8> },
}

/// Response from the overlay host
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum OverlayResponse {
    Ok,
    PeerRpc(PeerRpcResponse),

    /// Dial/forward failure, described for the log
    Error(String),
}

/// The sync RPC surface spoken between peers, in both directions
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PeerRpcRequest {
    GetChainId,
    GetHead,
    GetTopologyAtHeight(HeightRange),
    GetBlocksById { ids: Vec<BlockId> },
    GetAncestorTopology { block_id: BlockId, heights: Vec<u64> },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum PeerRpcResponse {
    ChainId(Vec<u8>),
    Head(BlockTopology),

    /// Unordered, duplicates tolerated, at most `num_blocks` entries
    TopologyAtHeight(Vec<BlockTopology>),

    /// Same order as the request; an empty entry means "don't have it"
    Blocks(Vec<Vec<u8>>),

    /// Ancestors of the requested block at each requested height
    AncestorTopology(Vec<BlockTopology>),

    /// Peer-side failure
    Error(String),
}

/// Inbound peer RPC delivered by the overlay for this node to answer
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerRpcInbound {
    pub from: PeerId,
    pub request: PeerRpcRequest,
}

/// A gossip message delivered by the overlay host
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GossipReceivedMessage {
    pub topic: String,
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Payload format of the `blocks` gossip topic
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GossipedBlock {
    pub topology: BlockTopology,
    pub block: Vec<u8>,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic message, get out of jail free card
    String(String),

    // Chain service RPC and broadcasts
    ChainRequest(ChainRequest),
    ChainResponse(ChainResponse),
    ForkHeads(ForkHeadsMessage),
    BlockAccepted(BlockAcceptedMessage),

    // Overlay host RPC and broadcasts
    OverlayRequest(OverlayRequest),
    OverlayResponse(OverlayResponse),
    PeerEvent(PeerEventMessage),
    PeerRpcInbound(PeerRpcInbound),
    PeerRpcResponse(PeerRpcResponse),
    GossipReceived(GossipReceivedMessage),
}

impl Default for Message {
    fn default() -> Self {
        Message::None(())
    }
}

// Casts from specific messages
impl From<ChainRequest> for Message {
    fn from(msg: ChainRequest) -> Self {
        Message::ChainRequest(msg)
    }
}

impl From<ChainResponse> for Message {
    fn from(msg: ChainResponse) -> Self {
        Message::ChainResponse(msg)
    }
}

impl From<OverlayRequest> for Message {
    fn from(msg: OverlayRequest) -> Self {
        Message::OverlayRequest(msg)
    }
}

impl From<OverlayResponse> for Message {
    fn from(msg: OverlayResponse) -> Self {
        Message::OverlayResponse(msg)
    }
}

impl From<PeerEventMessage> for Message {
    fn from(msg: PeerEventMessage) -> Self {
        Message::PeerEvent(msg)
    }
}

impl From<GossipReceivedMessage> for Message {
    fn from(msg: GossipReceivedMessage) -> Self {
        Message::GossipReceived(msg)
    }
}
