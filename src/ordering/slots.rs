//! Slot allocation: rank latest counts -> global slot space

use crate::core::particle_id::ParticleId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Global slot space and the base offset of each rank inside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    total_slots: u64,
    base_offsets: Vec<u64>,
}

impl SlotLayout {
    /// Lay out ranks contiguously in rank order.
    ///
    /// `counts[r]` is rank `r`'s latest count from the final time-group;
    /// `None` means the rank did not report one.
    pub fn from_counts(counts: &[Option<u32>]) -> Result<Self> {
        let mut base_offsets = Vec::with_capacity(counts.len());
        let mut total_slots = 0u64;
        for (rank, count) in counts.iter().enumerate() {
            let count = count.ok_or(Error::InconsistentRankCount { rank: rank as u32 })?;
            base_offsets.push(total_slots);
            total_slots += count as u64;
        }
        Ok(Self {
            total_slots,
            base_offsets,
        })
    }

    /// Rebuild a layout persisted in a store manifest
    pub fn from_parts(total_slots: u64, base_offsets: Vec<u64>) -> Self {
        Self {
            total_slots,
            base_offsets,
        }
    }

    pub fn total_slots(&self) -> u64 {
        self.total_slots
    }

    pub fn base_offsets(&self) -> &[u64] {
        &self.base_offsets
    }

    /// Slot of a raw identifier: `local_index + base_offset[rank] - 1`
    pub fn slot_of(&self, raw: u64) -> Result<u64> {
        let id = ParticleId::decode(raw);
        // Unknown ranks are placed past the end so they fail the range check.
        let base = self
            .base_offsets
            .get(id.rank as usize)
            .copied()
            .unwrap_or(self.total_slots);
        let slot = id.local_index as i64 + base as i64 - 1;
        if slot < 0 || slot as u64 >= self.total_slots {
            return Err(Error::SlotOutOfRange {
                id: raw,
                slot,
                total_slots: self.total_slots,
            });
        }
        Ok(slot as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_three_rank_layout() {
        let layout = SlotLayout::from_counts(&[Some(2), Some(3), Some(1)]).unwrap();
        assert_eq!(layout.total_slots(), 6);
        assert_eq!(layout.base_offsets(), &[0, 2, 5]);
        assert_eq!(layout.slot_of(ParticleId::new(1, 2).encode()).unwrap(), 3);
        assert_eq!(layout.slot_of(ParticleId::new(0, 1).encode()).unwrap(), 0);
        assert_eq!(layout.slot_of(ParticleId::new(2, 1).encode()).unwrap(), 5);
    }

    #[test]
    fn test_tag_does_not_move_slot() {
        let layout = SlotLayout::from_counts(&[Some(2), Some(3)]).unwrap();
        let tagged = ParticleId::new(1, 3).with_tag(9).encode();
        assert_eq!(layout.slot_of(tagged).unwrap(), 4);
    }

    #[test]
    fn test_missing_rank_count() {
        assert!(matches!(
            SlotLayout::from_counts(&[Some(2), None, Some(1)]),
            Err(Error::InconsistentRankCount { rank: 1 })
        ));
    }

    #[test]
    fn test_out_of_range() {
        let layout = SlotLayout::from_counts(&[Some(2), Some(3), Some(1)]).unwrap();
        for raw in [
            ParticleId::new(0, 0).encode(),
            ParticleId::new(2, 2).encode(),
            ParticleId::new(7, 1).encode(),
        ] {
            assert!(matches!(
                layout.slot_of(raw),
                Err(Error::SlotOutOfRange { total_slots: 6, .. })
            ));
        }
    }

    proptest! {
        #[test]
        fn prop_offsets_are_exclusive_prefix_sums(counts in proptest::collection::vec(0u32..10_000, 1..64)) {
            let wrapped: Vec<Option<u32>> = counts.iter().copied().map(Some).collect();
            let layout = SlotLayout::from_counts(&wrapped).unwrap();
            prop_assert_eq!(layout.base_offsets()[0], 0);
            for r in 1..counts.len() {
                prop_assert_eq!(
                    layout.base_offsets()[r],
                    layout.base_offsets()[r - 1] + counts[r - 1] as u64
                );
            }
            prop_assert_eq!(layout.total_slots(), counts.iter().map(|&c| c as u64).sum::<u64>());
        }
    }
}
