//! Selection results and the dead-slot post-filter

use crate::core::property::{Column, Property};
use crate::error::{Error, Result};
use crate::storage::ordered::OrderedStore;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Slots matched by a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Every slot of the store
    All,
    /// Sorted, de-duplicated slot indices
    Slots(Vec<u64>),
}

impl Selection {
    /// Number of selected slots out of `total_slots`
    pub fn len(&self, total_slots: u64) -> u64 {
        match self {
            Selection::All => total_slots,
            Selection::Slots(slots) => slots.len() as u64,
        }
    }

    pub fn is_empty(&self, total_slots: u64) -> bool {
        self.len(total_slots) == 0
    }

    pub fn contains(&self, slot: u64) -> bool {
        match self {
            Selection::All => true,
            Selection::Slots(slots) => slots.binary_search(&slot).is_ok(),
        }
    }

    /// Materialize the slot list
    pub fn to_slots(&self, total_slots: u64) -> Vec<u64> {
        match self {
            Selection::All => (0..total_slots).collect(),
            Selection::Slots(slots) => slots.clone(),
        }
    }
}

fn ids(column: Column) -> Result<Vec<u64>> {
    match column {
        Column::U64(ids) => Ok(ids),
        other => Err(Error::Storage(format!(
            "Id column has dtype {:?}",
            other.dtype()
        ))),
    }
}

/// Drop slots holding no live particle at any time of `window`
///
/// `All` stays `All` unless at least one slot is dead in the window.
pub fn retain_live(
    store: &mut OrderedStore,
    selection: Selection,
    window: RangeInclusive<usize>,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<Selection> {
    let total = store.total_slots();
    let step = chunk_size.max(1);

    match selection {
        Selection::All => {
            let mut live = Vec::new();
            let mut dead = 0u64;
            let mut start = 0u64;
            while start < total {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let len = (step as u64).min(total - start);
                let mut alive = vec![false; len as usize];
                for t in window.clone() {
                    for (a, id) in alive.iter_mut().zip(ids(store.read_range(Property::Id, t, start, len)?)?) {
                        *a |= id != 0;
                    }
                }
                for (i, a) in alive.into_iter().enumerate() {
                    if a {
                        live.push(start + i as u64);
                    } else {
                        dead += 1;
                    }
                }
                start += len;
            }
            debug!(dead_slots = dead, "dead-slot filter over all slots");
            if dead == 0 {
                Ok(Selection::All)
            } else {
                Ok(Selection::Slots(live))
            }
        }
        Selection::Slots(slots) => {
            let before = slots.len();
            let mut live = Vec::with_capacity(before);
            for chunk in slots.chunks(step) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let mut alive = vec![false; chunk.len()];
                for t in window.clone() {
                    for (a, id) in alive.iter_mut().zip(ids(store.read_slots(Property::Id, t, chunk)?)?) {
                        *a |= id != 0;
                    }
                }
                live.extend(chunk.iter().zip(alive).filter(|(_, a)| *a).map(|(s, _)| *s));
            }
            debug!(dead_slots = before - live.len(), "dead-slot filter");
            Ok(Selection::Slots(live))
        }
    }
}
