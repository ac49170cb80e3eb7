//! Reorder engine: disordered per-rank batches -> ordered store
//!
//! Time-indices are ordered one at a time in ascending order. After a
//! time-index is fully written its row data is synced and the manifest
//! advances to `Ordering { last_committed }`, so an interrupted run resumes
//! at the next index. An uncommitted row is rewritten from scratch.

use crate::config::TrackConfig;
use crate::core::particle_id::ParticleId;
use crate::core::property::{Column, Property};
use crate::core::record::RecordBatch;
use crate::error::{Error, Result};
use crate::index::unique_ids;
use crate::ordering::slots::SlotLayout;
use crate::storage::lock::ReorderLock;
use crate::storage::ordered::OrderedStore;
use crate::storage::source::DisorderedSource;
use std::collections::BTreeMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Summary of a reorder run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderReport {
    /// Store was already finished and reused untouched
    pub reused: bool,
    /// First time-index ordered by this run
    pub resumed_from: usize,
    /// Time-indices ordered by this run
    pub ordered: usize,
    pub total_times: usize,
    pub total_slots: u64,
}

/// Order `source` into the store at `dir`, resuming any previous progress.
///
/// Cancellation is checked between time-indices and between unique-id
/// chunks; a cancelled run returns `Error::Cancelled` with the manifest at
/// the last committed time-index.
pub fn reorder<S: DisorderedSource + ?Sized>(
    source: &mut S,
    dir: &Path,
    config: &TrackConfig,
    cancel: &CancellationToken,
) -> Result<ReorderReport> {
    if let Some(report) = finished_report(dir)? {
        return Ok(report);
    }

    let _lock = ReorderLock::acquire(dir)?;

    let species = source.species();
    let times = source.times()?;
    if times.is_empty() {
        return Err(Error::Storage(format!("No time-groups found for species '{}'", species)));
    }
    let layout = SlotLayout::from_counts(&source.latest_counts()?)?;
    let properties = source.properties();

    let mut store = if OrderedStore::exists(dir) {
        let store = OrderedStore::open_writable(dir)?;
        let manifest = store.manifest();
        if manifest.times != times
            || manifest.total_slots != layout.total_slots()
            || manifest.base_offsets != layout.base_offsets()
            || manifest.properties != properties
        {
            return Err(Error::Storage(format!(
                "Store {} does not match the disordered logs of '{}'",
                dir.display(),
                species
            )));
        }
        if store.state().is_finished() {
            return Ok(reused(&store));
        }
        store
    } else {
        OrderedStore::create(
            dir,
            &species,
            times.clone(),
            layout.total_slots(),
            layout.base_offsets().to_vec(),
            &properties,
        )?
    };

    let n_times = times.len();
    let resumed_from = store.state().next_index(n_times);
    info!(
        species = %species,
        times = n_times,
        total_slots = layout.total_slots(),
        resumed_from,
        "ordering particles"
    );

    for (t, &time) in times.times().iter().enumerate().skip(resumed_from) {
        if cancel.is_cancelled() {
            info!(index = t, "ordering cancelled");
            return Err(Error::Cancelled);
        }
        let records = order_time(source, &mut store, &layout, config.chunk_size, t, time)?;
        store.commit(t)?;
        debug!(time, index = t, records, "committed time-index");
    }

    info!("building unique-id index");
    unique_ids::build(&mut store, config.chunk_size, cancel)?;
    store.finish()?;
    info!(species = %species, "ordering finished");

    Ok(ReorderReport {
        reused: false,
        resumed_from,
        ordered: n_times - resumed_from,
        total_times: n_times,
        total_slots: layout.total_slots(),
    })
}

fn finished_report(dir: &Path) -> Result<Option<ReorderReport>> {
    if !OrderedStore::exists(dir) {
        return Ok(None);
    }
    let store = OrderedStore::open(dir)?;
    Ok(store.state().is_finished().then(|| reused(&store)))
}

fn reused(store: &OrderedStore) -> ReorderReport {
    ReorderReport {
        reused: true,
        resumed_from: store.times().len(),
        ordered: 0,
        total_times: store.times().len(),
        total_slots: store.total_slots(),
    }
}

/// Write every rank's batch at `time` into row `t`; returns the record count
fn order_time<S: DisorderedSource + ?Sized>(
    source: &mut S,
    store: &mut OrderedStore,
    layout: &SlotLayout,
    chunk_size: usize,
    t: usize,
    time: u64,
) -> Result<usize> {
    let counts = (0..source.n_ranks())
        .map(|r| source.batch_len(time, r))
        .collect::<Result<Vec<_>>>()?;
    let records: usize = counts.iter().sum();

    if records == 0 {
        store.reset_row(t)?;
    } else if records < chunk_size {
        scatter_rows(source, store, layout, &counts, t, time)?;
    } else {
        store.reset_row(t)?;
        let mut chunks = 0;
        for (rank, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let n_chunks = count.div_ceil(chunk_size);
            let size = count.div_ceil(n_chunks);
            let mut first = 0;
            while first < count {
                let last = (first + size).min(count);
                let batch = source.read_batch(time, rank as u32, first..last)?;
                write_sorted_runs(store, layout, t, &batch)?;
                first = last;
                chunks += 1;
            }
        }
        debug!(time, index = t, records, chunks, "ordered time-index in chunks");
    }
    Ok(records)
}

/// Small time-groups: build whole rows in memory and write each once
fn scatter_rows<S: DisorderedSource + ?Sized>(
    source: &mut S,
    store: &mut OrderedStore,
    layout: &SlotLayout,
    counts: &[usize],
    t: usize,
    time: u64,
) -> Result<()> {
    let total = store.total_slots() as usize;
    let mut rows: BTreeMap<Property, Column> = store
        .properties()
        .iter()
        .map(|p| (*p, Column::filled(p.dtype(), total)))
        .collect();

    for (rank, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let batch = live_only(source.read_batch(time, rank as u32, 0..count)?);
        let positions = batch
            .ids()
            .iter()
            .map(|&id| layout.slot_of(id).map(|s| s as usize))
            .collect::<Result<Vec<_>>>()?;
        for (prop, column) in batch.columns() {
            let row = rows
                .get_mut(prop)
                .ok_or_else(|| Error::UnknownProperty(prop.name().to_string()))?;
            column.scatter_into(row, &positions)?;
        }
    }

    for (prop, row) in &rows {
        store.write_row(*prop, t, row)?;
    }
    Ok(())
}

/// Large time-groups: sort a sub-chunk by identifier and write each run of
/// consecutive identifiers as one contiguous range
fn write_sorted_runs(
    store: &mut OrderedStore,
    layout: &SlotLayout,
    t: usize,
    batch: &RecordBatch,
) -> Result<()> {
    let ids = batch.ids();
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_unstable_by_key(|&i| ids[i]);
    let sorted = batch.permute(&order);
    let ids = sorted.ids();

    let mut start = ids.partition_point(|&id| !ParticleId::is_live(id));
    while start < ids.len() {
        let end = run_end(ids, start);
        let slot = layout.slot_of(ids[start])?;
        layout.slot_of(ids[end - 1])?;
        for (prop, column) in sorted.columns() {
            store.write_range(*prop, t, slot, &column.slice(start, end))?;
        }
        start = end;
    }
    Ok(())
}

/// End (exclusive) of the run of consecutive identifiers starting at `start`
fn run_end(sorted_ids: &[u64], start: usize) -> usize {
    let rank = ParticleId::decode(sorted_ids[start]).rank;
    let mut end = start + 1;
    while end < sorted_ids.len()
        && sorted_ids[end - 1].checked_add(1) == Some(sorted_ids[end])
        && ParticleId::decode(sorted_ids[end]).rank == rank
    {
        end += 1;
    }
    end
}

fn live_only(batch: RecordBatch) -> RecordBatch {
    let live: Vec<usize> = (0..batch.len())
        .filter(|&i| ParticleId::is_live(batch.ids()[i]))
        .collect();
    if live.len() == batch.len() {
        batch
    } else {
        batch.permute(&live)
    }
}
