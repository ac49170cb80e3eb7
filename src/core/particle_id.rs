//! Packed particle identifiers
//!
//! A tracked particle is identified by one `u64` written by the simulation.
//! The layout, from least to most significant bit, is:
//!
//! | bits    | width | field         |
//! |---------|-------|---------------|
//! | 0..32   | 32    | `local_index` |
//! | 32..56  | 24    | `rank`        |
//! | 56..64  | 8     | `tag`         |
//!
//! `local_index` counts from 1 on each rank; the raw value 0 means
//! "no particle in this slot".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bits holding the per-rank local index
pub const LOCAL_INDEX_BITS: u32 = 32;

/// Number of bits holding the rank
pub const RANK_BITS: u32 = 24;

/// Number of bits holding the generation tag
pub const TAG_BITS: u32 = 8;

const LOCAL_INDEX_MASK: u64 = (1 << LOCAL_INDEX_BITS) - 1;
const RANK_MASK: u64 = (1 << RANK_BITS) - 1;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Largest rank representable in an identifier
pub const MAX_RANK: u32 = RANK_MASK as u32;

/// Decoded particle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticleId {
    /// Generation tag written by the simulation (high 8 bits)
    pub tag: u8,
    /// Rank that created the particle (24 bits)
    pub rank: u32,
    /// Per-rank counter, starting at 1 (low 32 bits)
    pub local_index: u32,
}

impl ParticleId {
    /// Identifier of an unoccupied slot
    pub const NONE: u64 = 0;

    /// Create an identifier with a zero tag
    pub fn new(rank: u32, local_index: u32) -> Self {
        Self {
            tag: 0,
            rank,
            local_index,
        }
    }

    /// Set the generation tag
    pub fn with_tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    /// Unpack a raw identifier
    pub fn decode(raw: u64) -> Self {
        Self {
            tag: ((raw >> (LOCAL_INDEX_BITS + RANK_BITS)) & TAG_MASK) as u8,
            rank: ((raw >> LOCAL_INDEX_BITS) & RANK_MASK) as u32,
            local_index: (raw & LOCAL_INDEX_MASK) as u32,
        }
    }

    /// Pack into the raw on-disk representation.
    ///
    /// Ranks wider than 24 bits are truncated to the field width.
    pub fn encode(&self) -> u64 {
        ((self.tag as u64) << (LOCAL_INDEX_BITS + RANK_BITS))
            | (((self.rank as u64) & RANK_MASK) << LOCAL_INDEX_BITS)
            | self.local_index as u64
    }

    /// Whether a raw identifier denotes a live particle
    pub fn is_live(raw: u64) -> bool {
        raw != Self::NONE
    }
}

impl From<ParticleId> for u64 {
    fn from(id: ParticleId) -> Self {
        id.encode()
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.rank, self.local_index, self.tag)
    }
}
