//! Typed view over the chain / block-store service RPC

use std::sync::Arc;
use std::time::Duration;

use caryatid_sdk::Context;
use pharos_common::messages::{
    ApplyBlockMessage, ApplyTransactionMessage, ChainRequest, ChainResponse, Message,
};
use pharos_common::{ApplyBlockResult, ApplyTxResult, BlockId, BlockTopology, LocalHead};

/// Chain service failure as seen by the sync engine
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The service did not answer in time, or the bus request failed
    #[error("chain service unavailable: {0}")]
    Unavailable(String),

    /// Requested block id is not on the local chain
    #[error("block not on local chain")]
    NotOnChain,

    /// The service answered with something we did not ask for
    #[error("unexpected chain response: {0}")]
    Unexpected(String),
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Facade over the chain service bus topic.
///
/// Cheap to clone; every call is an independent request with a deadline.
#[derive(Clone)]
pub struct ChainClient {
    context: Arc<Context<Message>>,
    topic: String,
    timeout: Duration,
}

impl ChainClient {
    pub fn new(context: Arc<Context<Message>>, topic: String, timeout: Duration) -> Self {
        Self {
            context,
            topic,
            timeout,
        }
    }

    pub async fn head_info(&self) -> ChainResult<LocalHead> {
        match self.request(ChainRequest::GetHeadInfo).await? {
            ChainResponse::HeadInfo(head) => Ok(head),
            other => Err(unexpected(other)),
        }
    }

    pub async fn apply_block(
        &self,
        block: Vec<u8>,
        topology: Option<BlockTopology>,
    ) -> ChainResult<ApplyBlockResult> {
        let request = ChainRequest::ApplyBlock(ApplyBlockMessage { block, topology });
        match self.request(request).await? {
            ChainResponse::BlockApplied(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn apply_transaction(&self, tx: Vec<u8>) -> ChainResult<ApplyTxResult> {
        let request = ChainRequest::ApplyTransaction(ApplyTransactionMessage { tx });
        match self.request(request).await? {
            ChainResponse::TransactionApplied(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_ancestor_topology(
        &self,
        block_id: BlockId,
        heights: Vec<u64>,
    ) -> ChainResult<Vec<BlockTopology>> {
        let request = ChainRequest::GetAncestorTopology { block_id, heights };
        match self.request(request).await? {
            ChainResponse::AncestorTopology(ancestors) => Ok(ancestors),
            ChainResponse::NotOnChain => Err(ChainError::NotOnChain),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_chain_id(&self) -> ChainResult<Vec<u8>> {
        match self.request(ChainRequest::GetChainId).await? {
            ChainResponse::ChainId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_blocks(&self, ids: Vec<BlockId>) -> ChainResult<Vec<Vec<u8>>> {
        match self.request(ChainRequest::GetBlocks { ids }).await? {
            ChainResponse::Blocks(blocks) => Ok(blocks),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, request: ChainRequest) -> ChainResult<ChainResponse> {
        let message = Arc::new(Message::ChainRequest(request));
        let raw = tokio::time::timeout(
            self.timeout,
            self.context.message_bus.request(&self.topic, message),
        )
        .await
        .map_err(|_| ChainError::Unavailable("request deadline exceeded".into()))?
        .map_err(|e| ChainError::Unavailable(e.to_string()))?;

        match raw.as_ref() {
            Message::ChainResponse(ChainResponse::Error(e)) => {
                Err(ChainError::Unavailable(e.clone()))
            }
            Message::ChainResponse(response) => Ok(response.clone()),
            other => Err(ChainError::Unexpected(format!("{other:?}"))),
        }
    }
}

fn unexpected(response: ChainResponse) -> ChainError {
    ChainError::Unexpected(format!("{response:?}"))
}
