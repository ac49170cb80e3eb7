//! Disordered source: per-rank record batches for each dumped time

use crate::core::property::Property;
use crate::core::record::RecordBatch;
use crate::core::timeline::TimeAxis;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::ops::Range;

/// Read access to the disordered dump of one species
///
/// Batches are streamed by record range so callers decide how much of a
/// rank's time-group is decoded at once.
#[cfg_attr(test, mockall::automock)]
pub trait DisorderedSource {
    /// Species name
    fn species(&self) -> String;

    /// Number of writer ranks
    fn n_ranks(&self) -> u32;

    /// Properties recorded for this species (always includes `Id`)
    fn properties(&self) -> Vec<Property>;

    /// All time values present in any rank's log
    fn times(&self) -> Result<TimeAxis>;

    /// Per-rank latest count from the final time-group (`None` if absent)
    fn latest_counts(&self) -> Result<Vec<Option<u32>>>;

    /// Number of records a rank holds at a time (0 if it wrote none)
    fn batch_len(&self, time: u64, rank: u32) -> Result<usize>;

    /// Records `range` of a rank's batch at a time
    fn read_batch(&mut self, time: u64, rank: u32, range: Range<usize>) -> Result<RecordBatch>;
}

/// In-memory implementation of the disordered source (for testing)
pub struct InMemorySource {
    species: String,
    n_ranks: u32,
    properties: Vec<Property>,
    batches: HashMap<(u64, u32), RecordBatch>,
    latest_counts: HashMap<u32, u32>,
}

impl InMemorySource {
    /// Create an empty source
    pub fn new(species: &str, n_ranks: u32, properties: &[Property]) -> Self {
        let mut properties = properties.to_vec();
        if !properties.contains(&Property::Id) {
            properties.push(Property::Id);
        }
        properties.sort();
        properties.dedup();
        Self {
            species: species.to_string(),
            n_ranks,
            properties,
            batches: HashMap::new(),
            latest_counts: HashMap::new(),
        }
    }

    /// Add a rank's batch at a time
    pub fn push(&mut self, rank: u32, time: u64, batch: RecordBatch) -> Result<()> {
        if rank >= self.n_ranks {
            return Err(Error::MissingSource {
                species: self.species.clone(),
                rank,
            });
        }
        if batch.properties() != self.properties {
            return Err(Error::Storage(format!(
                "Batch properties {:?} differ from source properties {:?}",
                batch.properties(),
                self.properties
            )));
        }
        self.batches.insert((time, rank), batch);
        Ok(())
    }

    /// Record a rank's latest count in the final time-group
    pub fn set_latest_count(&mut self, rank: u32, count: u32) {
        self.latest_counts.insert(rank, count);
    }
}

impl DisorderedSource for InMemorySource {
    fn species(&self) -> String {
        self.species.clone()
    }

    fn n_ranks(&self) -> u32 {
        self.n_ranks
    }

    fn properties(&self) -> Vec<Property> {
        self.properties.clone()
    }

    fn times(&self) -> Result<TimeAxis> {
        Ok(TimeAxis::new(self.batches.keys().map(|(t, _)| *t)))
    }

    fn latest_counts(&self) -> Result<Vec<Option<u32>>> {
        Ok((0..self.n_ranks)
            .map(|r| self.latest_counts.get(&r).copied())
            .collect())
    }

    fn batch_len(&self, time: u64, rank: u32) -> Result<usize> {
        Ok(self.batches.get(&(time, rank)).map_or(0, |b| b.len()))
    }

    fn read_batch(&mut self, time: u64, rank: u32, range: Range<usize>) -> Result<RecordBatch> {
        match self.batches.get(&(time, rank)) {
            Some(batch) if range.end <= batch.len() && range.start <= range.end => {
                Ok(batch.slice(range.start, range.end))
            }
            Some(batch) => Err(Error::Storage(format!(
                "Record range {:?} outside batch of {} records",
                range,
                batch.len()
            ))),
            None if range.is_empty() => Ok(RecordBatch::empty(&self.properties)),
            None => Err(Error::Storage(format!(
                "Rank {} has no batch at time {}",
                rank, time
            ))),
        }
    }
}
