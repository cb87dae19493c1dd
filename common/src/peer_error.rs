//! Taxonomy of peer misbehaviour reported to the error handler

/// What a peer did wrong.
///
/// Transport kinds are retried where they occur and only accumulate score;
/// protocol kinds are non-retriable and carry enough weight to disconnect
/// immediately (see the blacklist configuration).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error, serde::Serialize,
    serde::Deserialize,
)]
pub enum PeerErrorKind {
    #[error("request timed out")]
    Timeout,

    #[error("RPC failed")]
    RpcError,

    #[error("connection lost")]
    ConnectionLost,

    #[error("peer is on a different chain")]
    WrongChain,

    #[error("peer disagrees with a configured checkpoint")]
    CheckpointMismatch,

    #[error("peer returned an empty response for a block it advertised")]
    ResponseEmpty,

    #[error("peer sent a block the chain rejected")]
    MalformedBlock,

    #[error("peer advertised topology outside the requested window")]
    TopologyOutOfWindow,

    #[error("peer advertised a block that exhausted its download attempts")]
    MaxAttemptsExceeded,
}

impl PeerErrorKind {
    /// Stable name used as the key in the configurable weight table
    pub fn name(&self) -> &'static str {
        match self {
            PeerErrorKind::Timeout => "timeout",
            PeerErrorKind::RpcError => "rpc_error",
            PeerErrorKind::ConnectionLost => "connection_lost",
            PeerErrorKind::WrongChain => "wrong_chain",
            PeerErrorKind::CheckpointMismatch => "checkpoint_mismatch",
            PeerErrorKind::ResponseEmpty => "response_empty",
            PeerErrorKind::MalformedBlock => "malformed_block",
            PeerErrorKind::TopologyOutOfWindow => "topology_out_of_window",
            PeerErrorKind::MaxAttemptsExceeded => "max_attempts_exceeded",
        }
    }
}
