//! Integration test: cold-sync the engine over the Caryatid bus against a
//! scripted chain service and overlay host.
//! Everything in this process is used for testing, don't accidentally
//! include in production builds
#![cfg(test)]

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Result;
use caryatid_process::Process;
use caryatid_sdk::{module, Context, Module};
use config::Config;
use pharos_common::messages::{
    ApplyBlockMessage, ChainRequest, ChainResponse, Message, OverlayRequest, OverlayResponse,
    PeerEventMessage, PeerRpcRequest, PeerRpcResponse,
};
use pharos_common::{
    ApplyBlockResult, ApplyTxResult, BlockId, BlockTopology, LocalHead, PeerId,
};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::info;

use pharos_module_block_sync::BlockSync;

/// Heights the scripted peer is ahead of us
const PEER_HEAD: u64 = 30;

const CHAIN_ID: [u8; 4] = [0x70, 0x68, 0x61, 0x31];

// --------- shared test completion signaling ---------
static TEST_COMPLETION_TX: Mutex<Option<watch::Sender<bool>>> = Mutex::new(None);
fn signal_test_completion() {
    if let Ok(tx) = TEST_COMPLETION_TX.lock() {
        if let Some(sender) = tx.as_ref() {
            let _ = sender.send(true);
        }
    }
}

fn block_id(height: u64) -> BlockId {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&height.to_be_bytes());
    bytes[31] = 0x5a;
    BlockId::new(bytes)
}

fn topology(height: u64) -> BlockTopology {
    BlockTopology {
        height,
        id: block_id(height),
        previous: if height == 0 {
            BlockId::default()
        } else {
            block_id(height - 1)
        },
    }
}

fn body(height: u64) -> Vec<u8> {
    height.to_be_bytes().to_vec()
}

// --------- mock chain service state ---------
struct ChainState {
    head_height: u64,
    applied_out_of_order: bool,
}

static CHAIN_STATE: OnceLock<Arc<Mutex<ChainState>>> = OnceLock::new();
fn chain_state() -> Arc<Mutex<ChainState>> {
    CHAIN_STATE
        .get_or_init(|| {
            Arc::new(Mutex::new(ChainState {
                head_height: 0,
                applied_out_of_order: false,
            }))
        })
        .clone()
}

fn head_info(height: u64) -> LocalHead {
    LocalHead {
        last_irreversible: topology(0),
        head: topology(height),
        fork_heads: vec![topology(height)],
    }
}

/// Chain service double: accepts blocks strictly in parent order
#[module(
    message_type(Message),
    name = "mock-chain",
    description = "Scripted chain service"
)]
struct MockChain;

impl MockChain {
    async fn init(&self, context: Arc<Context<Message>>, _config: Arc<Config>) -> Result<()> {
        context.handle("chain.rpc", move |request: Arc<Message>| async move {
            let Message::ChainRequest(request) = request.as_ref() else {
                return Arc::new(Message::ChainResponse(ChainResponse::Error(
                    "bad request".into(),
                )));
            };
            let response = Self::answer(request);
            Arc::new(Message::ChainResponse(response))
        });
        Ok(())
    }

    fn answer(request: &ChainRequest) -> ChainResponse {
        let state = chain_state();
        let mut state = state.lock().unwrap();
        match request {
            ChainRequest::GetChainId => ChainResponse::ChainId(CHAIN_ID.to_vec()),
            ChainRequest::GetHeadInfo => ChainResponse::HeadInfo(head_info(state.head_height)),
            ChainRequest::ApplyBlock(ApplyBlockMessage { topology: t, .. }) => {
                let Some(t) = t else {
                    return ChainResponse::Error("missing topology".into());
                };
                if t.height <= state.head_height {
                    return ChainResponse::BlockApplied(ApplyBlockResult::AlreadyHave);
                }
                if t.height != state.head_height + 1
                    || t.previous != block_id(state.head_height)
                {
                    state.applied_out_of_order = true;
                    return ChainResponse::BlockApplied(ApplyBlockResult::Rejected(
                        "parent is not my head".into(),
                    ));
                }
                state.head_height = t.height;
                info!(height = t.height, "mock chain applied block");
                if state.head_height == PEER_HEAD {
                    signal_test_completion();
                }
                ChainResponse::BlockApplied(ApplyBlockResult::Accepted)
            }
            ChainRequest::ApplyTransaction(_) => {
                ChainResponse::TransactionApplied(ApplyTxResult::Accepted)
            }
            ChainRequest::GetAncestorTopology { heights, .. } => ChainResponse::AncestorTopology(
                heights
                    .iter()
                    .filter(|h| **h <= state.head_height)
                    .map(|h| topology(*h))
                    .collect(),
            ),
            ChainRequest::GetBlocks { ids } => ChainResponse::Blocks(
                ids.iter().map(|_| Vec::new()).collect(),
            ),
        }
    }
}

/// Overlay host double: one scripted peer serving a 30-block chain
#[module(
    message_type(Message),
    name = "mock-overlay",
    description = "Scripted overlay host"
)]
struct MockOverlay;

impl MockOverlay {
    async fn init(&self, context: Arc<Context<Message>>, _config: Arc<Config>) -> Result<()> {
        context.handle("overlay.rpc", move |request: Arc<Message>| async move {
            let Message::OverlayRequest(request) = request.as_ref() else {
                return Arc::new(Message::OverlayResponse(OverlayResponse::Error(
                    "bad request".into(),
                )));
            };
            let response = match request {
                OverlayRequest::PeerRpc { request, .. } => {
                    OverlayResponse::PeerRpc(Self::peer_answer(request))
                }
                _ => OverlayResponse::Ok,
            };
            Arc::new(Message::OverlayResponse(response))
        });

        // Announce the peer once the engine is listening
        context.clone().run(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let event = Message::PeerEvent(PeerEventMessage::Connected {
                peer: PeerId::from("peer-a"),
                address: "/ip4/10.0.0.1/tcp/8888".into(),
            });
            context
                .publish("overlay.peer.events", Arc::new(event))
                .await
                .expect("failed to publish peer event");
        });
        Ok(())
    }

    fn peer_answer(request: &PeerRpcRequest) -> PeerRpcResponse {
        match request {
            PeerRpcRequest::GetChainId => PeerRpcResponse::ChainId(CHAIN_ID.to_vec()),
            PeerRpcRequest::GetHead => PeerRpcResponse::Head(topology(PEER_HEAD)),
            PeerRpcRequest::GetTopologyAtHeight(range) => {
                let Some(end) = range.end() else {
                    return PeerRpcResponse::TopologyAtHeight(Vec::new());
                };
                PeerRpcResponse::TopologyAtHeight(
                    (range.height..=end.min(PEER_HEAD)).map(topology).collect(),
                )
            }
            PeerRpcRequest::GetBlocksById { ids } => PeerRpcResponse::Blocks(
                ids.iter()
                    .map(|id| {
                        (1..=PEER_HEAD)
                            .find(|h| block_id(*h) == *id)
                            .map(body)
                            .unwrap_or_default()
                    })
                    .collect(),
            ),
            PeerRpcRequest::GetAncestorTopology { heights, .. } => {
                PeerRpcResponse::AncestorTopology(
                    heights.iter().filter(|h| **h <= PEER_HEAD).map(|h| topology(*h)).collect(),
                )
            }
        }
    }
}

const TEST_CONFIG: &str = r#"
[message-bus.internal]
class = "in-memory"

[module.block-sync]
peer-handler.height-range-poll-interval-ms = 100

[module.mock-chain]

[module.mock-overlay]
"#;

// -------------- the test --------------
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_sync_from_one_peer() -> Result<()> {
    let config = Arc::new(
        Config::builder()
            .add_source(config::File::from_str(TEST_CONFIG, config::FileFormat::Toml))
            .build()
            .unwrap(),
    );

    let (completion_tx, mut completion_rx) = watch::channel(false);
    {
        let mut tx = TEST_COMPLETION_TX.lock().unwrap();
        *tx = Some(completion_tx);
    }

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    MockChain::register(&mut process);
    MockOverlay::register(&mut process);
    BlockSync::register(&mut process);

    // Run until the mock chain has seen every block, bounded so a wedged
    // pipeline fails instead of hanging
    match timeout(Duration::from_secs(30), async {
        tokio::select! {
            result = process.run() => result,
            _ = completion_rx.changed() => Ok(()),
        }
    })
    .await
    {
        Ok(result) => result?,
        Err(_) => panic!("sync did not reach the peer head in time"),
    }

    let state = chain_state();
    let state = state.lock().unwrap();
    assert_eq!(state.head_height, PEER_HEAD);
    assert!(
        !state.applied_out_of_order,
        "a block was offered before its parent"
    );
    Ok(())
}
