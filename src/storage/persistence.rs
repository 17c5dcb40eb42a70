//! Snapshot persistence
//!
//! The whole store is written as one JSON document: first to a temporary
//! file, then atomically renamed over the previous snapshot.

use super::state::StoreState;
use super::StorageError;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FILE: &str = "txp-store.json";
const SNAPSHOT_TMP_FILE: &str = "txp-store.tmp";

/// Where a store's state goes after each mutation
pub trait Persistence: Send + Sync {
    fn save(&self, state: &StoreState) -> Result<(), StorageError>;
}

/// No persistence: state lives as long as the process
#[derive(Debug, Default, Clone, Copy)]
pub struct Volatile;

impl Persistence for Volatile {
    fn save(&self, _state: &StoreState) -> Result<(), StorageError> {
        Ok(())
    }
}

/// JSON snapshot in a data directory
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    data_dir: PathBuf,
}

impl SnapshotFile {
    pub fn new(data_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Load the last snapshot, or an empty state if none was written yet
    pub(crate) fn load(&self) -> Result<StoreState, StorageError> {
        let path = self.path();
        if !path.exists() {
            return Ok(StoreState::default());
        }

        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);
        let state: StoreState = serde_json::from_reader(reader).map_err(|e| {
            StorageError::InvalidData(format!("{}: {}", path.display(), e))
        })?;
        Ok(state)
    }
}

impl Persistence for SnapshotFile {
    fn save(&self, state: &StoreState) -> Result<(), StorageError> {
        // Write to temporary file first
        let temp_path = self.data_dir.join(SNAPSHOT_TMP_FILE);
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut writer, state)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        // Atomic rename
        fs::rename(&temp_path, self.path())?;
        Ok(())
    }
}
