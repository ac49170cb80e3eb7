//! Directory of per-rank disordered logs for one species.
//!
//! Every rank of the simulation appends to its own log file; this module
//! discovers those files, checks that no rank is missing, and exposes them
//! together as a `DisorderedSource`.

use crate::core::property::Property;
use crate::core::record::RecordBatch;
use crate::core::timeline::TimeAxis;
use crate::error::{Error, Result};
use crate::storage::log_file::{LogReader, LogWriter};
use crate::storage::source::DisorderedSource;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;

const LOG_PREFIX: &str = "disordered_";
const LOG_EXTENSION: &str = "trk";

/// Path of a rank's log inside a directory
pub fn log_path(dir: &Path, species: &str, rank: u32) -> PathBuf {
    dir.join(format!("{LOG_PREFIX}{species}_{rank:05}.{LOG_EXTENSION}"))
}

/// Split a log file name into (species, rank)
fn parse_log_name(name: &str) -> Option<(&str, u32)> {
    let stem = name
        .strip_prefix(LOG_PREFIX)?
        .strip_suffix(LOG_EXTENSION)?
        .strip_suffix('.')?;
    let (species, rank) = stem.rsplit_once('_')?;
    if species.is_empty() {
        return None;
    }
    Some((species, rank.parse().ok()?))
}

/// All per-rank logs of one species
pub struct LogDirectory {
    dir: PathBuf,
    species: String,
    readers: Vec<LogReader>,
    properties: Vec<Property>,
}

impl LogDirectory {
    /// List the tracked species that have logs in `dir`
    pub fn species<P: AsRef<Path>>(dir: P) -> Result<Vec<String>> {
        let mut found = BTreeSet::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            if let Some((species, _)) = entry.file_name().to_str().and_then(parse_log_name) {
                found.insert(species.to_string());
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Open every rank's log for `species`
    pub fn open<P: AsRef<Path>>(dir: P, species: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut by_rank: BTreeMap<u32, LogReader> = BTreeMap::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((found_species, rank)) = name.to_str().and_then(parse_log_name) else {
                continue;
            };
            if found_species != species {
                continue;
            }
            let reader = LogReader::open(entry.path())?;
            if reader.header().rank != rank {
                return Err(Error::Storage(format!(
                    "Log {} declares rank {}",
                    entry.path().display(),
                    reader.header().rank
                )));
            }
            by_rank.insert(rank, reader);
        }

        let Some(first) = by_rank.values().next() else {
            return Err(Error::MissingSource {
                species: species.to_string(),
                rank: 0,
            });
        };
        let n_ranks = first.header().n_ranks;
        let property_mask = first.header().property_mask;

        for (rank, reader) in &by_rank {
            let header = reader.header();
            if header.n_ranks != n_ranks || header.property_mask != property_mask {
                return Err(Error::Storage(format!(
                    "Log of rank {} disagrees with the other ranks ({} ranks, mask {:#x})",
                    rank, header.n_ranks, header.property_mask
                )));
            }
        }
        if let Some(rank) = (0..n_ranks).find(|r| !by_rank.contains_key(r)) {
            return Err(Error::MissingSource {
                species: species.to_string(),
                rank,
            });
        }
        if by_rank.len() as u32 != n_ranks {
            return Err(Error::Storage(format!(
                "Found {} logs for {} declared ranks",
                by_rank.len(),
                n_ranks
            )));
        }

        debug!(species, ranks = n_ranks, dir = %dir.display(), "opened disordered logs");
        Ok(Self {
            dir,
            species: species.to_string(),
            readers: by_rank.into_values().collect(),
            properties: Property::from_mask(property_mask),
        })
    }

    /// Create the log writer for one rank
    pub fn create_writer<P: AsRef<Path>>(
        dir: P,
        species: &str,
        rank: u32,
        n_ranks: u32,
        properties: &[Property],
    ) -> Result<LogWriter> {
        LogWriter::create(log_path(dir.as_ref(), species, rank), rank, n_ranks, properties)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn reader(&self, rank: u32) -> Result<&LogReader> {
        self.readers.get(rank as usize).ok_or_else(|| Error::MissingSource {
            species: self.species.clone(),
            rank,
        })
    }
}

impl DisorderedSource for LogDirectory {
    fn species(&self) -> String {
        self.species.clone()
    }

    fn n_ranks(&self) -> u32 {
        self.readers.len() as u32
    }

    fn properties(&self) -> Vec<Property> {
        self.properties.clone()
    }

    fn times(&self) -> Result<TimeAxis> {
        Ok(TimeAxis::new(
            self.readers
                .iter()
                .flat_map(|r| r.frames().iter().map(|f| f.time)),
        ))
    }

    fn latest_counts(&self) -> Result<Vec<Option<u32>>> {
        let Some(last) = self.times()?.last() else {
            return Ok(vec![None; self.readers.len()]);
        };
        Ok(self
            .readers
            .iter()
            .map(|r| r.frame(last).and_then(|f| f.latest_count))
            .collect())
    }

    fn batch_len(&self, time: u64, rank: u32) -> Result<usize> {
        Ok(self.reader(rank)?.frame(time).map_or(0, |f| f.record_count))
    }

    fn read_batch(&mut self, time: u64, rank: u32, range: Range<usize>) -> Result<RecordBatch> {
        let has_frame = self.reader(rank)?.frame(time).is_some();
        if !has_frame && range.is_empty() {
            return Ok(RecordBatch::empty(&self.properties));
        }
        self.readers[rank as usize].read_range(time, range)
    }
}
