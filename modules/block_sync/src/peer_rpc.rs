//! Typed view over the peer-to-peer sync RPC, one instance per peer.
//!
//! Calls are forwarded to the overlay host over the bus; the overlay frames
//! them onto the peer's RPC stream. Every call carries an explicit deadline,
//! enforced both here and by the overlay.

use std::sync::Arc;
use std::time::Duration;

use caryatid_sdk::Context;
use pharos_common::messages::{
    Message, OverlayRequest, OverlayResponse, PeerRpcRequest, PeerRpcResponse,
};
use pharos_common::{BlockId, BlockTopology, HeightRange, PeerErrorKind, PeerId};

/// Failure of a single peer RPC, classified for the error handler
#[derive(Debug, thiserror::Error)]
pub enum PeerRpcError {
    #[error("peer RPC timed out")]
    Timeout,

    #[error("peer RPC failed: {0}")]
    Rpc(String),
}

impl PeerRpcError {
    pub fn kind(&self) -> PeerErrorKind {
        match self {
            PeerRpcError::Timeout => PeerErrorKind::Timeout,
            PeerRpcError::Rpc(_) => PeerErrorKind::RpcError,
        }
    }
}

pub type PeerRpcResult<T> = Result<T, PeerRpcError>;

#[derive(Clone)]
pub struct PeerRpc {
    context: Arc<Context<Message>>,
    topic: String,
    peer: PeerId,
}

impl PeerRpc {
    pub fn new(context: Arc<Context<Message>>, topic: String, peer: PeerId) -> Self {
        Self {
            context,
            topic,
            peer,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub async fn get_chain_id(&self, deadline: Duration) -> PeerRpcResult<Vec<u8>> {
        match self.call(PeerRpcRequest::GetChainId, deadline).await? {
            PeerRpcResponse::ChainId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_head(&self, deadline: Duration) -> PeerRpcResult<BlockTopology> {
        match self.call(PeerRpcRequest::GetHead, deadline).await? {
            PeerRpcResponse::Head(head) => Ok(head),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_topology_at_height(
        &self,
        range: HeightRange,
        deadline: Duration,
    ) -> PeerRpcResult<Vec<BlockTopology>> {
        let request = PeerRpcRequest::GetTopologyAtHeight(range);
        match self.call(request, deadline).await? {
            PeerRpcResponse::TopologyAtHeight(topologies) => Ok(topologies),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_blocks_by_id(
        &self,
        ids: &[BlockId],
        deadline: Duration,
    ) -> PeerRpcResult<Vec<Vec<u8>>> {
        let request = PeerRpcRequest::GetBlocksById { ids: ids.to_vec() };
        match self.call(request, deadline).await? {
            PeerRpcResponse::Blocks(blocks) => Ok(blocks),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_ancestor_topology(
        &self,
        block_id: BlockId,
        heights: Vec<u64>,
        deadline: Duration,
    ) -> PeerRpcResult<Vec<BlockTopology>> {
        let request = PeerRpcRequest::GetAncestorTopology { block_id, heights };
        match self.call(request, deadline).await? {
            PeerRpcResponse::AncestorTopology(ancestors) => Ok(ancestors),
            other => Err(unexpected(other)),
        }
    }

    async fn call(
        &self,
        request: PeerRpcRequest,
        deadline: Duration,
    ) -> PeerRpcResult<PeerRpcResponse> {
        let message = Arc::new(Message::OverlayRequest(OverlayRequest::PeerRpc {
            peer: self.peer.clone(),
            deadline_ms: deadline.as_millis() as u64,
            request,
        }));
        let raw = tokio::time::timeout(
            deadline,
            self.context.message_bus.request(&self.topic, message),
        )
        .await
        .map_err(|_| PeerRpcError::Timeout)?
        .map_err(|e| PeerRpcError::Rpc(e.to_string()))?;

        match raw.as_ref() {
            Message::OverlayResponse(OverlayResponse::PeerRpc(response)) => {
                match response {
                    PeerRpcResponse::Error(e) => Err(PeerRpcError::Rpc(e.clone())),
                    other => Ok(other.clone()),
                }
            }
            Message::OverlayResponse(OverlayResponse::Error(e)) => {
                Err(PeerRpcError::Rpc(e.clone()))
            }
            other => Err(PeerRpcError::Rpc(format!("unexpected response: {other:?}"))),
        }
    }
}

fn unexpected(response: PeerRpcResponse) -> PeerRpcError {
    PeerRpcError::Rpc(format!("unexpected response: {response:?}"))
}
