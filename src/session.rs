//! Query session over a finished ordered store

use crate::config::TrackConfig;
use crate::core::property::{Column, Property};
use crate::core::record::RecordBatch;
use crate::core::timeline::TimeWindow;
use crate::error::{Error, Result};
use crate::index::unique_ids;
use crate::query::selection::{retain_live, Selection};
use crate::query::selector::Selector;
use crate::storage::log_directory::LogDirectory;
use crate::storage::manifest::Manifest;
use crate::storage::ordered::OrderedStore;
use crate::storage::source::DisorderedSource;
use crate::trajectory::TrajectoryTable;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Store directory used for a species when none is given
pub fn default_store_dir(log_dir: &Path, species: &str) -> PathBuf {
    log_dir.join(format!("{}.ordered", species))
}

/// What to select
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// Selector expression; empty selects everything
    Expression(String),
    /// Slots whose particle identifier is in the list
    Ids(Vec<u64>),
}

impl Default for Query {
    fn default() -> Self {
        Query::Expression(String::new())
    }
}

/// Which times `fetch` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRequest {
    /// Every time of the session window
    #[default]
    All,
    /// One exact time value inside the window
    At(u64),
}

/// Read-only session on one species' ordered store.
///
/// Sessions do not share state; open one per thread to read a store
/// concurrently.
pub struct TrackSession {
    store: OrderedStore,
    config: TrackConfig,
    requested_window: TimeWindow,
    window: RangeInclusive<usize>,
    log_dir: Option<PathBuf>,
    stamp: Uuid,
    cache: HashMap<Query, Selection>,
    active: Option<Selection>,
    cancel: CancellationToken,
}

impl TrackSession {
    /// Open a finished store. The disordered logs are looked up in the
    /// store's parent directory unless `with_log_dir` says otherwise.
    pub fn open<P: AsRef<Path>>(store_dir: P, config: TrackConfig, window: TimeWindow) -> Result<Self> {
        config.validate()?;
        let store = OrderedStore::open(store_dir.as_ref())?;
        store.require_finished()?;
        let range = store.times().resolve(window)?;
        let (stamp, _) = store.stamp();
        let log_dir = store_dir.as_ref().parent().map(Path::to_path_buf);

        info!(
            species = %store.manifest().species,
            times = store.times().len(),
            total_slots = store.total_slots(),
            "opened track session"
        );
        Ok(Self {
            store,
            config,
            requested_window: window,
            window: range,
            log_dir,
            stamp,
            cache: HashMap::new(),
            active: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_log_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.log_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn species(&self) -> &str {
        &self.store.manifest().species
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    /// Time values of the session window
    pub fn times(&self) -> &[u64] {
        &self.store.times().times()[self.window.clone()]
    }

    /// Every time value of the store
    pub fn all_times(&self) -> &[u64] {
        self.store.times().times()
    }

    pub fn total_slots(&self) -> u64 {
        self.store.total_slots()
    }

    pub fn properties(&self) -> &[Property] {
        self.store.properties()
    }

    /// Stamp of the store state this session reads
    pub fn stamp(&self) -> Uuid {
        self.stamp
    }

    /// Reopen the store if it was re-ordered since the session last looked
    fn refresh(&mut self) -> Result<()> {
        let manifest = Manifest::load(self.store.dir())?;
        if manifest.stamp == self.stamp && manifest.state.is_finished() {
            return Ok(());
        }
        let store = OrderedStore::open(self.store.dir())?;
        store.require_finished()?;
        self.window = store.times().resolve(self.requested_window)?;
        self.stamp = store.stamp().0;
        self.store = store;
        self.cache.clear();
        self.active = None;
        info!(stamp = %self.stamp, "store changed, selection cache cleared");
        Ok(())
    }

    /// Run a query; the result becomes the selection `fetch` reads
    pub fn select(&mut self, query: &Query) -> Result<Selection> {
        self.refresh()?;
        if let Some(selection) = self.cache.get(query) {
            debug!(?query, "selection cache hit");
            self.active = Some(selection.clone());
            return Ok(selection.clone());
        }

        let chunk_size = self.config.chunk_size;
        let raw = match query {
            Query::Expression(text) => {
                let selector = Selector::parse(text, self.store.properties(), self.store.times())?;
                selector.evaluate(&mut self.store, chunk_size, &self.cancel)?
            }
            Query::Ids(ids) => {
                Selection::Slots(unique_ids::matching_slots(&mut self.store, ids, chunk_size)?)
            }
        };
        let selection = retain_live(&mut self.store, raw, self.window.clone(), chunk_size, &self.cancel)?;
        info!(
            selected = selection.len(self.store.total_slots()),
            "selection ready"
        );

        self.cache.insert(query.clone(), selection.clone());
        self.active = Some(selection.clone());
        Ok(selection)
    }

    /// Time-major table of the active selection.
    ///
    /// An empty property list fetches every recorded property. Without a
    /// prior `select`, every live slot is fetched.
    pub fn fetch(&mut self, properties: &[Property], request: TimeRequest) -> Result<TrajectoryTable> {
        self.refresh()?;
        let selection = match self.active.clone() {
            Some(selection) => selection,
            None => self.select(&Query::default())?,
        };
        let properties = if properties.is_empty() {
            self.store.properties().to_vec()
        } else {
            properties.to_vec()
        };
        let indices: Vec<usize> = match request {
            TimeRequest::All => self.window.clone().collect(),
            TimeRequest::At(time) => match self.store.times().index_of(time) {
                Some(i) if self.window.contains(&i) => vec![i],
                _ => {
                    return Err(Error::Configuration(format!(
                        "Time {} is not available in this session",
                        time
                    )))
                }
            },
        };
        TrajectoryTable::load(&mut self.store, &selection, &properties, &indices, &self.config)
    }

    /// Unsorted per-chunk view of the disordered logs at one time
    pub fn iterate(&self, time: u64, chunk_size: usize) -> Result<ParticleChunks<LogDirectory>> {
        let dir = self
            .log_dir
            .as_ref()
            .ok_or_else(|| Error::Configuration("No log directory for this session".to_string()))?;
        let logs = LogDirectory::open(dir, self.species())?;
        ParticleChunks::new(logs, time, chunk_size)
    }
}

/// Chunks of at most `chunk_size` records of one time, in rank order.
///
/// Restartable from the beginning with `rewind`, not from the middle.
pub struct ParticleChunks<S: DisorderedSource> {
    source: S,
    time: u64,
    chunk_size: usize,
    properties: Vec<Property>,
    rank: u32,
    offset: usize,
    done: bool,
}

impl<S: DisorderedSource> ParticleChunks<S> {
    pub fn new(source: S, time: u64, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Configuration("chunk_size must be positive".to_string()));
        }
        if source.times()?.index_of(time).is_none() {
            return Err(Error::Configuration(format!(
                "Time {} is not available for '{}'",
                time,
                source.species()
            )));
        }
        let properties = source.properties();
        Ok(Self {
            source,
            time,
            chunk_size,
            properties,
            rank: 0,
            offset: 0,
            done: false,
        })
    }

    /// Start again from the first rank
    pub fn rewind(&mut self) {
        self.rank = 0;
        self.offset = 0;
        self.done = false;
    }

    fn fill(&mut self) -> Result<Option<RecordBatch>> {
        let mut columns: BTreeMap<Property, Column> = self
            .properties
            .iter()
            .map(|p| (*p, Column::filled(p.dtype(), 0)))
            .collect();
        let mut filled = 0;

        while filled < self.chunk_size && self.rank < self.source.n_ranks() {
            let len = self.source.batch_len(self.time, self.rank)?;
            if self.offset >= len {
                self.rank += 1;
                self.offset = 0;
                continue;
            }
            let end = (self.offset + self.chunk_size - filled).min(len);
            let batch = self.source.read_batch(self.time, self.rank, self.offset..end)?;
            for (prop, column) in batch.columns() {
                if let Some(target) = columns.get_mut(prop) {
                    target.extend(column)?;
                }
            }
            filled += end - self.offset;
            self.offset = end;
        }

        if filled == 0 {
            return Ok(None);
        }
        RecordBatch::from_columns(columns).map(Some)
    }
}

impl<S: DisorderedSource> Iterator for ParticleChunks<S> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::particle_id::ParticleId;
    use crate::ordering::reorder::reorder;
    use tempfile::TempDir;

    fn batch(rank: u32, rows: &[(u32, f64)]) -> RecordBatch {
        let mut columns = BTreeMap::new();
        columns.insert(
            Property::Id,
            Column::U64(rows.iter().map(|(l, _)| ParticleId::new(rank, *l).encode()).collect()),
        );
        columns.insert(Property::X, Column::F64(rows.iter().map(|(_, x)| *x).collect()));
        RecordBatch::from_columns(columns).unwrap()
    }

    /// Two ranks, times 10/20/30. Slots: r0l1=0, r0l2=1, r0l3=2 (never
    /// written), r1l1=3, r1l2=4. Slot 3 jumps between 20 and 30.
    fn fixture(dir: &Path) -> PathBuf {
        let mut w0 = LogDirectory::create_writer(dir, "ion", 0, 2, &[Property::X]).unwrap();
        w0.append(10, &batch(0, &[(2, 5.0), (1, 0.0)]), None).unwrap();
        w0.append(20, &batch(0, &[(1, 0.5)]), None).unwrap();
        w0.append(30, &batch(0, &[(1, 0.9), (2, -0.2)]), Some(3)).unwrap();
        w0.finish().unwrap();

        let mut w1 = LogDirectory::create_writer(dir, "ion", 1, 2, &[Property::X]).unwrap();
        w1.append(10, &batch(1, &[(1, 1.0)]), None).unwrap();
        w1.append(20, &batch(1, &[(2, -3.0), (1, 1.2)]), None).unwrap();
        w1.append(30, &batch(1, &[(1, 9.0)]), Some(2)).unwrap();
        w1.finish().unwrap();

        let store_dir = default_store_dir(dir, "ion");
        let mut logs = LogDirectory::open(dir, "ion").unwrap();
        reorder(&mut logs, &store_dir, &config(), &CancellationToken::new()).unwrap();
        store_dir
    }

    fn config() -> TrackConfig {
        TrackConfig {
            chunk_size: 2,
            timestep: 0.1,
            ..TrackConfig::default()
        }
    }

    fn expr(s: &str) -> Query {
        Query::Expression(s.to_string())
    }

    #[test]
    fn test_open_requires_finished_store() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = temp_dir.path().join("ion.ordered");
        OrderedStore::create(&store_dir, "ion", crate::core::timeline::TimeAxis::new(vec![1]), 1, vec![0], &[])
            .unwrap();
        assert!(matches!(
            TrackSession::open(&store_dir, config(), TimeWindow::All),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_empty_selector_matches_any_live() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());
        let mut session = TrackSession::open(&store_dir, config(), TimeWindow::All).unwrap();
        assert_eq!(session.total_slots(), 5);

        let everything = session.select(&expr("")).unwrap();
        assert_eq!(everything, Selection::Slots(vec![0, 1, 3, 4]));
        let a = session.fetch(&[], TimeRequest::All).unwrap();

        let live = session.select(&expr("any(t, Id>0)")).unwrap();
        assert_eq!(live, everything);
        let b = session.fetch(&[], TimeRequest::All).unwrap();
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn test_all_at_single_time_equals_predicate() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());
        let mut session = TrackSession::open(&store_dir, config(), TimeWindow::Nearest(21)).unwrap();
        assert_eq!(session.times(), &[20]);

        let all = session.select(&expr("all(t==20, x>0)")).unwrap();
        let any = session.select(&expr("any(t==20, x>0)")).unwrap();
        assert_eq!(all, Selection::Slots(vec![0, 3]));
        assert_eq!(all, any);

        // same answer when the window also covers times the clause skips
        let mut wide = TrackSession::open(&store_dir, config(), TimeWindow::All).unwrap();
        let all = wide.select(&expr("all(t==20, x>0)")).unwrap();
        let any = wide.select(&expr("any(t==20, x>0)")).unwrap();
        assert_eq!(all, Selection::Slots(vec![0, 3]));
        assert_eq!(all, any);
    }

    #[test]
    fn test_dead_slots_never_returned() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());
        let mut session = TrackSession::open(&store_dir, config(), TimeWindow::All).unwrap();

        // slot 2 was never written, slot 4 never had x > 0
        assert_eq!(session.select(&expr("~any(t, x>0)")).unwrap(), Selection::Slots(vec![4]));

        let mut late = TrackSession::open(&store_dir, config(), TimeWindow::Between(25, 40)).unwrap();
        assert_eq!(late.select(&expr("")).unwrap(), Selection::Slots(vec![0, 1, 3]));
    }

    #[test]
    fn test_select_by_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());
        let mut session = TrackSession::open(&store_dir, config(), TimeWindow::All).unwrap();
        let ids = vec![ParticleId::new(1, 2).encode(), 999];
        assert_eq!(session.select(&Query::Ids(ids)).unwrap(), Selection::Slots(vec![4]));
    }

    #[test]
    fn test_fetch_and_breaks() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());
        let mut session = TrackSession::open(&store_dir, config(), TimeWindow::All).unwrap();

        let table = session.fetch(&[Property::X], TimeRequest::All).unwrap();
        assert_eq!(table.times, vec![10, 20, 30]);
        assert_eq!(table.slots, vec![0, 1, 3, 4]);
        assert_eq!(table.breaks.broken_count(), 1);
        let jump = table.breaks.breaks(2)[0];
        assert_eq!(jump.time_index, 2);
        assert_eq!(jump.axis, Property::X);
        assert!((jump.speed - 7.8).abs() < 1e-9);

        let single = session.fetch(&[Property::X], TimeRequest::At(20)).unwrap();
        assert_eq!(single.times, vec![20]);
        assert_eq!(single.breaks.broken_count(), 0);
        assert!(matches!(
            session.fetch(&[Property::X], TimeRequest::At(25)),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            session.fetch(&[Property::Chi], TimeRequest::All),
            Err(Error::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_cache_invalidated_by_new_stamp() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());
        let mut session = TrackSession::open(&store_dir, config(), TimeWindow::All).unwrap();
        let first = session.select(&expr("any(t, x>1)")).unwrap();
        let before = session.stamp();

        let mut manifest = Manifest::load(&store_dir).unwrap();
        manifest.stamp = Uuid::new_v4();
        manifest.save(&store_dir).unwrap();

        assert_eq!(session.select(&expr("any(t, x>1)")).unwrap(), first);
        assert_ne!(session.stamp(), before);
        assert_eq!(session.stamp(), manifest.stamp);
    }

    #[test]
    fn test_concurrent_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dir = store_dir.clone();
                std::thread::spawn(move || {
                    let mut session = TrackSession::open(&dir, config(), TimeWindow::All).unwrap();
                    session.select(&expr("any(t, x>0.7)")).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Selection::Slots(vec![0, 1, 3]));
        }
    }

    #[test]
    fn test_iterate_disordered_logs() {
        let temp_dir = TempDir::new().unwrap();
        let store_dir = fixture(temp_dir.path());
        let session = TrackSession::open(&store_dir, config(), TimeWindow::All).unwrap();

        let mut chunks = session.iterate(30, 2).unwrap();
        let sizes: Vec<usize> = chunks.by_ref().map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert!(chunks.next().is_none());

        chunks.rewind();
        let ids: Vec<u64> = chunks.flat_map(|c| c.unwrap().ids().to_vec()).collect();
        assert_eq!(
            ids,
            vec![
                ParticleId::new(0, 1).encode(),
                ParticleId::new(0, 2).encode(),
                ParticleId::new(1, 1).encode()
            ]
        );

        assert_eq!(session.iterate(20, 10).unwrap().count(), 1);
        assert!(matches!(session.iterate(15, 2), Err(Error::Configuration(_))));
    }
}
