//! Store manifest: the durable ordering state of an ordered store
//!
//! The manifest is the only place the store records how far the reorder
//! got. It is replaced atomically (write temp file, fsync, rename) after
//! the array data it vouches for has been synced.

use crate::core::property::Property;
use crate::core::timeline::TimeAxis;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Manifest file name inside a store directory
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_VERSION: u32 = 1;

/// Ordering progress of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrderingState {
    /// Arrays allocated, no time-index committed yet
    Empty,
    /// Every time-index up to and including `last_committed` is written
    Ordering { last_committed: usize },
    /// All time-indices and the unique-id index are written
    Finished,
}

impl OrderingState {
    /// First time-index that still needs ordering
    pub fn next_index(&self, n_times: usize) -> usize {
        match self {
            OrderingState::Empty => 0,
            OrderingState::Ordering { last_committed } => last_committed + 1,
            OrderingState::Finished => n_times,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, OrderingState::Finished)
    }
}

/// Persistent description of an ordered store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub species: String,
    pub state: OrderingState,
    pub times: TimeAxis,
    pub total_slots: u64,
    pub base_offsets: Vec<u64>,
    pub properties: Vec<Property>,
    /// Changes whenever the store is (re)created or finished
    pub stamp: Uuid,
}

impl Manifest {
    pub fn new(
        species: &str,
        times: TimeAxis,
        total_slots: u64,
        base_offsets: Vec<u64>,
        properties: Vec<Property>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            species: species.to_string(),
            state: OrderingState::Empty,
            times,
            total_slots,
            base_offsets,
            properties,
            stamp: Uuid::new_v4(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Whether a manifest exists in `dir`
    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).is_file()
    }

    /// Load the manifest from a store directory
    pub fn load(dir: &Path) -> Result<Self> {
        let data = fs::read(Self::path(dir))?;
        let manifest: Manifest = serde_json::from_slice(&data)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(Error::Storage(format!(
                "Unsupported manifest version: {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Atomically replace the manifest in `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));

        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(self)?)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        sync_dir(dir)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_next_index() {
        assert_eq!(OrderingState::Empty.next_index(4), 0);
        assert_eq!(OrderingState::Ordering { last_committed: 1 }.next_index(4), 2);
        assert_eq!(OrderingState::Finished.next_index(4), 4);
    }

    #[test]
    fn test_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let mut manifest = Manifest::new(
            "electron",
            TimeAxis::new(vec![0, 10]),
            6,
            vec![0, 2, 5],
            vec![Property::Id, Property::X],
        );
        assert!(!Manifest::exists(temp_dir.path()));
        manifest.save(temp_dir.path()).unwrap();
        assert_eq!(Manifest::load(temp_dir.path()).unwrap(), manifest);

        manifest.state = OrderingState::Ordering { last_committed: 0 };
        manifest.save(temp_dir.path()).unwrap();
        let loaded = Manifest::load(temp_dir.path()).unwrap();
        assert_eq!(loaded.state, OrderingState::Ordering { last_committed: 0 });
        assert!(!temp_dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn test_state_serialized_as_tag() {
        let json = serde_json::to_string(&OrderingState::Ordering { last_committed: 3 }).unwrap();
        assert_eq!(json, r#"{"state":"ordering","last_committed":3}"#);
    }
}
