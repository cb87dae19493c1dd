//! Core type definitions for Pharos
// We don't use these types in the pharos_common crate itself
#![allow(dead_code)]

use crate::hash::BlockId;
use anyhow::{bail, Error, Result};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The minimal identity of a block in the fork graph.
///
/// Two topologies are the same block iff `(height, id)` match; `previous`
/// may be the all-zero sentinel when the advertising peer did not know it.
#[derive(Debug, Default, Clone, Copy, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockTopology {
    /// Block height
    pub height: u64,

    /// Block id
    pub id: BlockId,

    /// Id of the previous block, if known
    pub previous: BlockId,
}

impl PartialEq for BlockTopology {
    fn eq(&self, other: &Self) -> bool {
        self.height == other.height && self.id == other.id
    }
}

impl std::hash::Hash for BlockTopology {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.height.hash(state);
        self.id.hash(state);
    }
}

impl Ord for BlockTopology {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height.cmp(&other.height).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for BlockTopology {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for BlockTopology {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.height)
    }
}

/// A window of heights a peer should report topology for.
///
/// Covers the closed interval `[height, height + num_blocks - 1]`;
/// `num_blocks == 0` means no interest.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct HeightRange {
    pub height: u64,
    pub num_blocks: u32,
}

impl HeightRange {
    pub fn new(height: u64, num_blocks: u32) -> Self {
        Self { height, num_blocks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0
    }

    pub fn contains(&self, height: u64) -> bool {
        !self.is_empty()
            && height >= self.height
            && height - self.height < self.num_blocks as u64
    }

    /// Last height covered, if any
    pub fn end(&self) -> Option<u64> {
        (!self.is_empty()).then(|| self.height + self.num_blocks as u64 - 1)
    }
}

/// Opaque peer identifier assigned by the overlay host
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An operator-asserted `(height, id)` pair any honest peer must match
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub id: BlockId,
}

impl FromStr for Checkpoint {
    type Err = Error;

    /// Parses the `height:hex-id` form used in configuration
    fn from_str(s: &str) -> Result<Self> {
        let Some((height, id)) = s.split_once(':') else {
            bail!("checkpoint must be in form height:id, was '{s}'");
        };
        Ok(Self {
            height: height.parse()?,
            id: id.parse()?,
        })
    }
}

/// Local chain head state, as reported by the chain service
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LocalHead {
    /// Deepest block the chain service commits to never revert
    pub last_irreversible: BlockTopology,

    /// Head of the currently favoured fork
    pub head: BlockTopology,

    /// Heads of all known forks, favoured one included
    pub fork_heads: Vec<BlockTopology>,
}

impl LocalHead {
    /// True if `id` heads any known fork
    pub fn is_fork_head(&self, id: &BlockId) -> bool {
        self.head.id == *id || self.fork_heads.iter().any(|f| f.id == *id)
    }
}

/// Chain service verdict on a submitted block
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApplyBlockResult {
    Accepted,
    AlreadyHave,
    Rejected(String),
}

/// Chain service verdict on a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ApplyTxResult {
    Accepted,
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_equality_ignores_previous() {
        let a = BlockTopology {
            height: 7,
            id: BlockId::new([1; 32]),
            previous: BlockId::new([2; 32]),
        };
        let b = BlockTopology {
            height: 7,
            id: BlockId::new([1; 32]),
            previous: BlockId::default(),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn height_range_interval() {
        let range = HeightRange::new(10, 5);
        assert!(range.contains(10));
        assert!(range.contains(14));
        assert!(!range.contains(15));
        assert_eq!(range.end(), Some(14));
        assert!(HeightRange::empty().end().is_none());
        assert!(!HeightRange::empty().contains(0));
    }

    #[test]
    fn checkpoint_parses_height_and_id() {
        let cp: Checkpoint =
            "50:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
                .parse()
                .unwrap();
        assert_eq!(cp.height, 50);
        assert_eq!(cp.id, BlockId::new([0xaa; 32]));

        assert!("50".parse::<Checkpoint>().is_err());
        assert!("x:aa".parse::<Checkpoint>().is_err());
    }
}
