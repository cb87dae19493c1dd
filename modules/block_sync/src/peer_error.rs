//! Aggregates errors from every component, scores peers and decides who
//! gets disconnected and blocked.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pharos_common::{PeerErrorKind, PeerId};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::configuration::BlacklistConfig;
use crate::peer_handler::PeerError;
use crate::supervisor::SupervisorCommand;

#[derive(Debug)]
pub enum BlacklistCommand {
    /// Is this peer currently blocked? Asked by the supervisor on connect.
    CheckPeer {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
}

struct PeerScore {
    score: f64,
    updated: Instant,
}

/// Scoring state, kept free of I/O for testing.
///
/// Scores decay back to zero over the rolling window; kinds with a negative
/// weight disconnect immediately.
pub struct ScoreBoard {
    config: BlacklistConfig,
    scores: HashMap<PeerId, PeerScore>,
    blocked: HashMap<PeerId, Instant>,
}

impl ScoreBoard {
    pub fn new(config: BlacklistConfig) -> Self {
        Self {
            config,
            scores: HashMap::new(),
            blocked: HashMap::new(),
        }
    }

    fn weight(&self, kind: PeerErrorKind) -> f64 {
        self.config.weights.get(kind.name()).copied().unwrap_or(1.0)
    }

    /// Record one error; returns true when the peer should be disconnected
    /// (and marks it blocked for the cooldown period).
    pub fn record(&mut self, peer: &PeerId, kind: PeerErrorKind, now: Instant) -> bool {
        let weight = self.weight(kind);
        let disconnect = if weight < 0.0 {
            true
        } else {
            let decay_per_ms =
                self.config.disconnect_threshold / self.config.rolling_window_ms as f64;
            let entry = self.scores.entry(peer.clone()).or_insert(PeerScore {
                score: 0.0,
                updated: now,
            });
            let elapsed_ms = now.duration_since(entry.updated).as_millis() as f64;
            entry.score = (entry.score - elapsed_ms * decay_per_ms).max(0.0) + weight;
            entry.updated = now;
            entry.score > self.config.disconnect_threshold
        };

        if disconnect {
            self.scores.remove(peer);
            self.blocked
                .insert(peer.clone(), now + Duration::from_millis(self.config.cooldown_ms));
        }
        disconnect
    }

    pub fn is_blocked(&mut self, peer: &PeerId, now: Instant) -> bool {
        match self.blocked.get(peer) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.blocked.remove(peer);
                false
            }
            None => false,
        }
    }
}

pub struct PeerErrorHandler {
    scores: ScoreBoard,
    errors: mpsc::Receiver<PeerError>,
    commands: mpsc::Receiver<BlacklistCommand>,
    supervisor: mpsc::Sender<SupervisorCommand>,
    cancel: CancellationToken,
}

impl PeerErrorHandler {
    pub fn new(
        scores: ScoreBoard,
        errors: mpsc::Receiver<PeerError>,
        commands: mpsc::Receiver<BlacklistCommand>,
        supervisor: mpsc::Sender<SupervisorCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scores,
            errors,
            commands,
            supervisor,
            cancel,
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                _ = self.cancel.cancelled() => return,
                error = self.errors.recv() => {
                    let Some(PeerError { peer, kind }) = error else { return };
                    debug!(peer = %peer, error = %kind, "peer error");
                    if self.scores.record(&peer, kind, Instant::now()) {
                        warn!(peer = %peer, error = %kind, "disconnecting misbehaving peer");
                        let command = SupervisorCommand::Disconnect { peer };
                        if self.supervisor.send(command).await.is_err() {
                            return;
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(BlacklistCommand::CheckPeer { peer, reply }) => {
                            let blocked = self.scores.is_blocked(&peer, Instant::now());
                            let _ = reply.send(blocked);
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BlacklistConfig {
        let mut weights = HashMap::new();
        weights.insert("timeout".to_string(), 1.0);
        weights.insert("response_empty".to_string(), 2.0);
        weights.insert("wrong_chain".to_string(), -1.0);
        weights.insert("checkpoint_mismatch".to_string(), -1.0);
        BlacklistConfig {
            disconnect_threshold: 10.0,
            cooldown_ms: 1_800_000,
            rolling_window_ms: 300_000,
            weights,
        }
    }

    fn peer(name: &str) -> PeerId {
        PeerId::from(name)
    }

    #[test]
    fn disconnects_when_score_crosses_threshold() {
        let mut scores = ScoreBoard::new(config());
        let now = Instant::now();
        let p = peer("a");

        // ten timeouts reach the threshold, the eleventh crosses it
        for _ in 0..10 {
            assert!(!scores.record(&p, PeerErrorKind::Timeout, now));
        }
        assert!(scores.record(&p, PeerErrorKind::Timeout, now));
        assert!(scores.is_blocked(&p, now));
    }

    #[test]
    fn infinite_weights_disconnect_immediately() {
        let mut scores = ScoreBoard::new(config());
        let now = Instant::now();
        assert!(scores.record(&peer("a"), PeerErrorKind::WrongChain, now));
        assert!(scores.record(&peer("b"), PeerErrorKind::CheckpointMismatch, now));
    }

    #[test]
    fn score_decays_over_the_rolling_window() {
        let mut scores = ScoreBoard::new(config());
        let now = Instant::now();
        let p = peer("a");
        for _ in 0..10 {
            scores.record(&p, PeerErrorKind::Timeout, now);
        }
        // after a full window the old errors have decayed away
        let later = now + Duration::from_millis(300_000);
        for _ in 0..10 {
            assert!(!scores.record(&p, PeerErrorKind::Timeout, later));
        }
    }

    #[test]
    fn heavier_kinds_accumulate_faster() {
        let mut scores = ScoreBoard::new(config());
        let now = Instant::now();
        let p = peer("a");
        for _ in 0..5 {
            assert!(!scores.record(&p, PeerErrorKind::ResponseEmpty, now));
        }
        assert!(scores.record(&p, PeerErrorKind::ResponseEmpty, now));
    }

    #[test]
    fn block_expires_after_cooldown() {
        let mut scores = ScoreBoard::new(config());
        let now = Instant::now();
        let p = peer("a");
        scores.record(&p, PeerErrorKind::WrongChain, now);
        assert!(scores.is_blocked(&p, now));
        assert!(scores.is_blocked(&p, now + Duration::from_millis(1_799_999)));
        assert!(!scores.is_blocked(&p, now + Duration::from_millis(1_800_001)));
    }

    #[test]
    fn unknown_kinds_default_to_weight_one() {
        let mut scores = ScoreBoard::new(config());
        let now = Instant::now();
        let p = peer("a");
        for _ in 0..10 {
            assert!(!scores.record(&p, PeerErrorKind::RpcError, now));
        }
        assert!(scores.record(&p, PeerErrorKind::RpcError, now));
    }
}
