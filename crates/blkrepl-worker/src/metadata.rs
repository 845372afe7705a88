//! Data generation UUIDs and the metadata persistence collaborator.
//!
//! Each device carries a current UUID, a bitmap UUID (the generation the
//! out-of-sync bitmap is relative to) and a short history. After a resync
//! the bitmap UUID is pushed into the history so a later reconnect can tell
//! how the two copies relate.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReplResult;

/// Number of history slots.
pub const HISTORY_LEN: usize = 2;

/// Generation identifiers of one copy of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UuidSet {
    /// Current data generation.
    pub current: u64,
    /// Generation the bitmap tracks changes against (0 = none).
    pub bitmap: u64,
    /// Older generations, newest first.
    pub history: [u64; HISTORY_LEN],
}

impl UuidSet {
    /// Start a fresh data generation; the old one becomes the bitmap UUID.
    pub fn new_current(&mut self) {
        self.bitmap = self.current;
        self.current = rand::random::<u64>() & !1;
    }

    /// Shift history by one slot, dropping the oldest.
    fn move_history(&mut self) {
        for i in (1..HISTORY_LEN).rev() {
            self.history[i] = self.history[i - 1];
        }
    }

    /// Retire the bitmap UUID into the history (bitmap is now clean).
    /// No-op if there is no bitmap UUID.
    pub fn rotate_bitmap_into_history(&mut self) {
        if self.bitmap == 0 {
            return;
        }
        self.move_history();
        self.history[0] = self.bitmap;
        self.bitmap = 0;
    }

    /// Take over the peer's generations after becoming its exact copy:
    /// our old current UUID becomes the bitmap UUID.
    pub fn adopt_from_sync_source(&mut self, peer: &UuidSet) {
        self.history = peer.history;
        self.bitmap = self.current;
        self.current = peer.current;
    }
}

/// Everything persisted for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MetadataRecord {
    /// Generation identifiers.
    pub uuids: UuidSet,
    /// Local data is consistent.
    pub consistent: bool,
    /// Local data was up to date when last persisted.
    pub up_to_date: bool,
    /// Peer data was known to be outdated.
    pub peer_outdated: bool,
    /// Verify resume position in sectors.
    pub ov_start_sector: u64,
}

/// Persists device metadata.
pub trait MetadataStore: Send + Sync {
    /// Write `record` for device `minor` durably.
    fn persist(&self, minor: u32, record: &MetadataRecord) -> ReplResult<()>;
}

/// Keeps the latest serialized record per minor in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: Mutex<HashMap<u32, Vec<u8>>>,
    syncs: Mutex<u64>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the last record persisted for `minor`.
    pub fn load(&self, minor: u32) -> ReplResult<Option<MetadataRecord>> {
        match self.records.lock().get(&minor) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of persist calls so far.
    pub fn sync_count(&self) -> u64 {
        *self.syncs.lock()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn persist(&self, minor: u32, record: &MetadataRecord) -> ReplResult<()> {
        let bytes = bincode::serialize(record)?;
        self.records.lock().insert(minor, bytes);
        *self.syncs.lock() += 1;
        Ok(())
    }
}

/// Writes one file per minor into a directory.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    /// Store records under `dir` (must exist).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, minor: u32) -> PathBuf {
        self.dir.join(format!("md-{}.bin", minor))
    }

    /// Read back the record for `minor`.
    pub fn load(&self, minor: u32) -> ReplResult<MetadataRecord> {
        let bytes = std::fs::read(self.path(minor))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

impl MetadataStore for FileMetadataStore {
    fn persist(&self, minor: u32, record: &MetadataRecord) -> ReplResult<()> {
        let path = self.path(minor);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bincode::serialize(record)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!("persisted metadata for minor {} to {}", minor, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_bitmap_into_history() {
        let mut u = UuidSet {
            current: 10,
            bitmap: 20,
            history: [30, 40],
        };
        u.rotate_bitmap_into_history();
        assert_eq!(u.bitmap, 0);
        assert_eq!(u.history, [20, 30]);
        assert_eq!(u.current, 10);

        // nothing to rotate a second time
        u.rotate_bitmap_into_history();
        assert_eq!(u.history, [20, 30]);
    }

    #[test]
    fn test_new_current_moves_to_bitmap() {
        let mut u = UuidSet {
            current: 10,
            ..Default::default()
        };
        u.new_current();
        assert_eq!(u.bitmap, 10);
        assert_ne!(u.current, 10);
        assert_eq!(u.current & 1, 0);
    }

    #[test]
    fn test_adopt_from_sync_source() {
        let mut target = UuidSet {
            current: 5,
            bitmap: 0,
            history: [6, 7],
        };
        let source = UuidSet {
            current: 100,
            bitmap: 5,
            history: [101, 102],
        };
        target.adopt_from_sync_source(&source);
        assert_eq!(target.current, 100);
        assert_eq!(target.bitmap, 5);
        assert_eq!(target.history, [101, 102]);
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryMetadataStore::new();
        assert!(store.load(1).unwrap().is_none());
        let rec = MetadataRecord {
            consistent: true,
            ov_start_sector: 64,
            ..Default::default()
        };
        store.persist(1, &rec).unwrap();
        assert_eq!(store.load(1).unwrap(), Some(rec));
        assert_eq!(store.sync_count(), 1);
    }

    #[test]
    fn test_file_store() {
        let dir = std::env::temp_dir().join(format!("blkrepl-md-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = FileMetadataStore::new(&dir);
        let rec = MetadataRecord {
            up_to_date: true,
            ..Default::default()
        };
        store.persist(7, &rec).unwrap();
        assert_eq!(store.load(7).unwrap(), rec);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
