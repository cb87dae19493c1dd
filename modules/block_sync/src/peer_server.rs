//! The served side of the sync RPC: answers the same four queries this node
//! asks its peers, backed by the local chain service.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use caryatid_sdk::Context;
use pharos_common::messages::{Message, PeerRpcInbound, PeerRpcRequest, PeerRpcResponse};
use pharos_common::BlockTopology;
use tracing::debug;

use crate::chain::{ChainClient, ChainError};

/// Upper bound on topology entries returned to one query, whatever window
/// the peer asked for
const MAX_TOPOLOGY_RESULTS: usize = 500;

pub fn register(context: &Arc<Context<Message>>, topic: &str, chain: ChainClient) {
    context.handle(topic, move |request: Arc<Message>| {
        let chain = chain.clone();
        async move {
            let Message::PeerRpcInbound(PeerRpcInbound { from, request }) = request.as_ref()
            else {
                return Arc::new(Message::PeerRpcResponse(PeerRpcResponse::Error(
                    "invalid message for sync service".into(),
                )));
            };
            debug!(peer = %from, "serving sync request");
            let response = answer(&chain, request)
                .await
                .unwrap_or_else(|e| PeerRpcResponse::Error(e.to_string()));
            Arc::new(Message::PeerRpcResponse(response))
        }
    });
}

async fn answer(chain: &ChainClient, request: &PeerRpcRequest) -> Result<PeerRpcResponse> {
    match request {
        PeerRpcRequest::GetChainId => {
            let id = chain.get_chain_id().await?;
            Ok(PeerRpcResponse::ChainId(id))
        }
        PeerRpcRequest::GetHead => {
            let head = chain.head_info().await?;
            Ok(PeerRpcResponse::Head(head.head))
        }
        PeerRpcRequest::GetTopologyAtHeight(range) => {
            if range.is_empty() {
                return Ok(PeerRpcResponse::TopologyAtHeight(Vec::new()));
            }
            let head = chain.head_info().await?;
            let mut found: HashSet<BlockTopology> = HashSet::new();
            // Ancestors of every fork head cover all blocks we could serve
            // in the window
            for fork in std::iter::once(&head.head).chain(head.fork_heads.iter()) {
                let heights: Vec<u64> = (range.height..=fork.height.min(range.end().unwrap()))
                    .take(MAX_TOPOLOGY_RESULTS)
                    .collect();
                if heights.is_empty() {
                    continue;
                }
                match chain.get_ancestor_topology(fork.id, heights).await {
                    Ok(ancestors) => found.extend(ancestors),
                    Err(ChainError::NotOnChain) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(PeerRpcResponse::TopologyAtHeight(found.into_iter().collect()))
        }
        PeerRpcRequest::GetBlocksById { ids } => {
            let blocks = chain.get_blocks(ids.clone()).await?;
            Ok(PeerRpcResponse::Blocks(blocks))
        }
        PeerRpcRequest::GetAncestorTopology { block_id, heights } => {
            match chain.get_ancestor_topology(*block_id, heights.clone()).await {
                Ok(ancestors) => Ok(PeerRpcResponse::AncestorTopology(ancestors)),
                Err(ChainError::NotOnChain) => {
                    Ok(PeerRpcResponse::Error("block not on chain".into()))
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}
