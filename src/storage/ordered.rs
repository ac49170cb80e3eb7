//! Ordered store: one (time-index x slot) array per property plus a manifest

use crate::core::property::{Column, Dtype, Property};
use crate::core::timeline::TimeAxis;
use crate::error::{Error, Result};
use crate::storage::array_file::ArrayFile;
use crate::storage::manifest::{Manifest, OrderingState};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// File holding the per-slot maximum identifier
pub const UNIQUE_IDS_FILE: &str = "unique_Id.arr";

fn array_path(dir: &Path, prop: Property) -> PathBuf {
    dir.join(format!("{}.arr", prop.name()))
}

/// Time-ordered particle store
///
/// Row `t` of every array holds the observations at time-index `t`; column
/// `s` holds the particle that owns slot `s`.
pub struct OrderedStore {
    dir: PathBuf,
    manifest: Manifest,
    arrays: BTreeMap<Property, ArrayFile>,
    unique_ids: Option<ArrayFile>,
    writable: bool,
}

impl OrderedStore {
    /// Allocate a new store, replacing whatever was in `dir`.
    ///
    /// The manifest is written last, so a crash during allocation leaves no
    /// manifest and the next run allocates again.
    pub fn create<P: AsRef<Path>>(
        dir: P,
        species: &str,
        times: TimeAxis,
        total_slots: u64,
        base_offsets: Vec<u64>,
        properties: &[Property],
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        if Manifest::exists(&dir) {
            std::fs::remove_file(Manifest::path(&dir))?;
        }

        let mut props = properties.to_vec();
        if !props.contains(&Property::Id) {
            props.push(Property::Id);
        }
        props.sort();
        props.dedup();

        let n_times = times.len() as u64;
        let mut arrays = BTreeMap::new();
        for prop in &props {
            let array = ArrayFile::create(array_path(&dir, *prop), prop.dtype(), n_times, total_slots)?;
            arrays.insert(*prop, array);
        }
        let stale_unique = dir.join(UNIQUE_IDS_FILE);
        if stale_unique.exists() {
            std::fs::remove_file(stale_unique)?;
        }

        let manifest = Manifest::new(species, times, total_slots, base_offsets, props);
        manifest.save(&dir)?;
        debug!(dir = %dir.display(), times = n_times, total_slots, "allocated ordered store");

        Ok(Self {
            dir,
            manifest,
            arrays,
            unique_ids: None,
            writable: true,
        })
    }

    /// Open an existing store for reading
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with(dir.as_ref(), false)
    }

    /// Open an existing store for ordering
    pub fn open_writable<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with(dir.as_ref(), true)
    }

    fn open_with(dir: &Path, writable: bool) -> Result<Self> {
        let manifest = Manifest::load(dir)?;
        let mut arrays = BTreeMap::new();
        for prop in &manifest.properties {
            let array = ArrayFile::open(array_path(dir, *prop), writable)?;
            let header = array.header();
            if header.n_rows != manifest.times.len() as u64 || header.n_cols != manifest.total_slots {
                return Err(Error::Storage(format!(
                    "Array {} has shape [{}, {}], manifest says [{}, {}]",
                    prop,
                    header.n_rows,
                    header.n_cols,
                    manifest.times.len(),
                    manifest.total_slots
                )));
            }
            arrays.insert(*prop, array);
        }
        let unique_ids = if manifest.state.is_finished() {
            Some(ArrayFile::open(dir.join(UNIQUE_IDS_FILE), writable)?)
        } else {
            None
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            arrays,
            unique_ids,
            writable,
        })
    }

    /// Whether `dir` holds a store manifest
    pub fn exists<P: AsRef<Path>>(dir: P) -> bool {
        Manifest::exists(dir.as_ref())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn state(&self) -> OrderingState {
        self.manifest.state
    }

    pub fn times(&self) -> &TimeAxis {
        &self.manifest.times
    }

    pub fn total_slots(&self) -> u64 {
        self.manifest.total_slots
    }

    pub fn properties(&self) -> &[Property] {
        &self.manifest.properties
    }

    /// Identity of the current store contents
    pub fn stamp(&self) -> (Uuid, OrderingState) {
        (self.manifest.stamp, self.manifest.state)
    }

    /// Fail unless the reorder has finished
    pub fn require_finished(&self) -> Result<()> {
        if self.manifest.state.is_finished() {
            Ok(())
        } else {
            Err(Error::Storage(format!(
                "Store {} is not finished ({:?})",
                self.dir.display(),
                self.manifest.state
            )))
        }
    }

    fn array(&mut self, prop: Property) -> Result<&mut ArrayFile> {
        self.arrays
            .get_mut(&prop)
            .ok_or_else(|| Error::UnknownProperty(prop.name().to_string()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::Storage(format!("Store {} is read-only", self.dir.display())))
        }
    }

    /// Read `len` slots of a property at a time-index
    pub fn read_range(&mut self, prop: Property, t: usize, start: u64, len: u64) -> Result<Column> {
        self.array(prop)?.read_range(t as u64, start, len)
    }

    /// Read arbitrary sorted slots, one read per run of consecutive slots
    pub fn read_slots(&mut self, prop: Property, t: usize, slots: &[u64]) -> Result<Column> {
        let array = self.array(prop)?;
        let mut out = Column::filled(prop.dtype(), 0);
        let mut i = 0;
        while i < slots.len() {
            let mut j = i + 1;
            while j < slots.len() && slots[j] == slots[j - 1] + 1 {
                j += 1;
            }
            out.extend(&array.read_range(t as u64, slots[i], (j - i) as u64)?)?;
            i = j;
        }
        Ok(out)
    }

    /// Write a contiguous slot range of a property at a time-index
    pub fn write_range(&mut self, prop: Property, t: usize, start: u64, values: &Column) -> Result<()> {
        self.check_writable()?;
        self.array(prop)?.write_range(t as u64, start, values)
    }

    /// Overwrite the whole row of a property
    pub fn write_row(&mut self, prop: Property, t: usize, values: &Column) -> Result<()> {
        self.check_writable()?;
        self.array(prop)?.write_row(t as u64, values)
    }

    /// Reset every property's row to its fill value
    pub fn reset_row(&mut self, t: usize) -> Result<()> {
        self.check_writable()?;
        let total = self.manifest.total_slots as usize;
        for (prop, array) in self.arrays.iter_mut() {
            array.write_row(t as u64, &Column::filled(prop.dtype(), total))?;
        }
        Ok(())
    }

    /// Durably record that time-index `t` is fully written
    pub fn commit(&mut self, t: usize) -> Result<()> {
        self.check_writable()?;
        let expected = self.manifest.state.next_index(self.manifest.times.len());
        if t != expected {
            return Err(Error::Storage(format!(
                "Cannot commit time-index {} while the next one is {}",
                t, expected
            )));
        }
        for array in self.arrays.values() {
            array.sync()?;
        }
        self.manifest.state = OrderingState::Ordering { last_committed: t };
        self.manifest.save(&self.dir)
    }

    /// Allocate the unique-id array (fill 0)
    pub fn create_unique_ids(&mut self) -> Result<()> {
        self.check_writable()?;
        let array = ArrayFile::create(
            self.dir.join(UNIQUE_IDS_FILE),
            Dtype::U64,
            1,
            self.manifest.total_slots,
        )?;
        self.unique_ids = Some(array);
        Ok(())
    }

    fn unique_array(&mut self) -> Result<&mut ArrayFile> {
        self.unique_ids
            .as_mut()
            .ok_or_else(|| Error::Storage("Unique-id index not built".to_string()))
    }

    pub fn write_unique_ids(&mut self, start: u64, ids: &[u64]) -> Result<()> {
        self.check_writable()?;
        self.unique_array()?
            .write_range(0, start, &Column::U64(ids.to_vec()))
    }

    pub fn read_unique_ids(&mut self, start: u64, len: u64) -> Result<Vec<u64>> {
        match self.unique_array()?.read_range(0, start, len)? {
            Column::U64(ids) => Ok(ids),
            other => Err(Error::Storage(format!(
                "Unique-id index has dtype {:?}",
                other.dtype()
            ))),
        }
    }

    /// Mark the store finished; requires every time-index committed
    pub fn finish(&mut self) -> Result<()> {
        self.check_writable()?;
        let n_times = self.manifest.times.len();
        if self.manifest.state.next_index(n_times) != n_times {
            return Err(Error::Storage(format!(
                "Cannot finish store in state {:?}",
                self.manifest.state
            )));
        }
        match &self.unique_ids {
            Some(array) => array.sync()?,
            None => return Err(Error::Storage("Unique-id index not built".to_string())),
        }
        self.manifest.state = OrderingState::Finished;
        self.manifest.stamp = Uuid::new_v4();
        self.manifest.save(&self.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &Path) -> OrderedStore {
        OrderedStore::create(
            dir,
            "electron",
            TimeAxis::new(vec![0, 10]),
            4,
            vec![0, 4],
            &[Property::X, Property::Q],
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let created = store(temp_dir.path());
        assert_eq!(created.properties(), &[Property::Id, Property::X, Property::Q]);
        assert_eq!(created.state(), OrderingState::Empty);

        let mut opened = OrderedStore::open(temp_dir.path()).unwrap();
        assert_eq!(opened.total_slots(), 4);
        assert_eq!(opened.read_range(Property::Id, 1, 0, 4).unwrap(), Column::U64(vec![0; 4]));
        assert!(opened.write_range(Property::Id, 0, 0, &Column::U64(vec![1])).is_err());
        assert!(opened.require_finished().is_err());
        assert!(matches!(
            opened.read_range(Property::Chi, 0, 0, 1),
            Err(Error::UnknownProperty(_))
        ));
    }

    #[test]
    fn test_read_slots_gathers_runs() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = store(temp_dir.path());
        s.write_row(Property::Id, 0, &Column::U64(vec![10, 11, 12, 13])).unwrap();
        assert_eq!(
            s.read_slots(Property::Id, 0, &[0, 2, 3]).unwrap(),
            Column::U64(vec![10, 12, 13])
        );
    }

    #[test]
    fn test_commit_sequence_and_finish() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = store(temp_dir.path());
        assert!(s.commit(1).is_err());
        s.commit(0).unwrap();
        assert!(s.finish().is_err());
        s.commit(1).unwrap();
        assert!(s.finish().is_err());

        s.create_unique_ids().unwrap();
        s.write_unique_ids(1, &[7, 8]).unwrap();
        let before = s.stamp().0;
        s.finish().unwrap();
        assert_ne!(s.stamp().0, before);

        let mut opened = OrderedStore::open(temp_dir.path()).unwrap();
        assert!(opened.require_finished().is_ok());
        assert_eq!(opened.read_unique_ids(0, 4).unwrap(), vec![0, 7, 8, 0]);
    }

    #[test]
    fn test_reset_row() {
        let temp_dir = TempDir::new().unwrap();
        let mut s = store(temp_dir.path());
        s.write_range(Property::X, 1, 1, &Column::F64(vec![1.5])).unwrap();
        s.write_range(Property::Q, 1, 1, &Column::I16(vec![3])).unwrap();
        s.reset_row(1).unwrap();
        assert!(s.read_range(Property::X, 1, 0, 4).unwrap().to_f64().iter().all(|v| v.is_nan()));
        assert_eq!(s.read_range(Property::Q, 1, 0, 4).unwrap(), Column::I16(vec![0; 4]));
    }
}
