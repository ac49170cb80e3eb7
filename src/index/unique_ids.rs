//! Unique-id index: the maximum identifier each slot ever held

use crate::core::property::{Column, Property};
use crate::error::{Error, Result};
use crate::storage::ordered::OrderedStore;
use hashbrown::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Number of slots per chunk so that one chunk across all times holds at
/// most `chunk_size` identifiers
fn slots_per_chunk(chunk_size: usize, n_times: usize) -> u64 {
    (chunk_size / n_times.max(1)).max(1) as u64
}

/// Compute and write the unique-id index of a fully ordered store
pub fn build(store: &mut OrderedStore, chunk_size: usize, cancel: &CancellationToken) -> Result<()> {
    store.create_unique_ids()?;

    let n_times = store.times().len();
    let total = store.total_slots();
    let step = slots_per_chunk(chunk_size, n_times);

    let mut start = 0;
    let mut chunks = 0;
    while start < total {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let len = step.min(total - start);
        let mut max_ids = vec![0u64; len as usize];
        for t in 0..n_times {
            let ids = match store.read_range(Property::Id, t, start, len)? {
                Column::U64(ids) => ids,
                other => {
                    return Err(Error::Storage(format!("Id column has dtype {:?}", other.dtype())))
                }
            };
            for (m, id) in max_ids.iter_mut().zip(ids) {
                *m = (*m).max(id);
            }
        }
        store.write_unique_ids(start, &max_ids)?;
        start += len;
        chunks += 1;
    }
    debug!(total_slots = total, chunks, "unique-id index written");
    Ok(())
}

/// Slots whose maximum identifier is one of `ids`, ascending
pub fn matching_slots(store: &mut OrderedStore, ids: &[u64], chunk_size: usize) -> Result<Vec<u64>> {
    let wanted: HashSet<u64> = ids.iter().copied().filter(|&id| id != 0).collect();
    let total = store.total_slots();
    let step = chunk_size.max(1) as u64;

    let mut slots = Vec::new();
    let mut start = 0;
    while start < total && !wanted.is_empty() {
        let len = step.min(total - start);
        let unique = store.read_unique_ids(start, len)?;
        slots.extend(
            unique
                .iter()
                .enumerate()
                .filter(|(_, id)| wanted.contains(*id))
                .map(|(i, _)| start + i as u64),
        );
        start += len;
    }
    Ok(slots)
}
