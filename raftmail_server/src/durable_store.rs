//! Durable persistence for the application state: users, messages and sessions. Every
//! mutating call is flushed to stable storage before it returns, mirroring how
//! `raft_consensus`'s `DefaultPersistentStorage` persists the Raft log: rewrite the whole
//! snapshot to a temp file and atomically rename it into place. Simpler than in-place update
//! and cheap enough at this system's expected data volume.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bincode::Options;

use crate::app_state::Snapshot;

#[derive(Debug)]
pub enum DurableStoreError {
    Io,
    Serde,
}

/// Single-threaded-per-call key-value persistence for `Snapshot`. Concurrent writers are
/// serialized through an internal mutex, matching the "concurrent writes must be serialized"
/// contract; in practice only the Raft thread's apply loop ever calls `persist`.
#[derive(Debug)]
pub struct DurableStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DurableStore {
    pub fn new(data_dir: &Path) -> Self {
        std::fs::create_dir_all(data_dir).expect("STORAGE INIT: could not create data directory");
        DurableStore {
            path: data_dir.join("state.bin"),
            write_lock: Mutex::new(()),
        }
    }

    /// Loads the persisted snapshot, or an empty one if this node has never committed
    /// anything yet.
    pub fn load(&self) -> Snapshot {
        let Ok(file) = File::open(&self.path) else {
            return Snapshot::default();
        };
        bincode_options()
            .deserialize_from(BufReader::new(file))
            .expect("STORAGE INIT: durable store contains corrupt state")
    }

    /// Atomically overwrites the durable snapshot. An I/O failure here is fatal: the caller
    /// cannot safely continue once it can no longer durably record application state.
    pub fn persist(&self, snapshot: &Snapshot) -> Result<(), DurableStoreError> {
        let _guard = self.write_lock.lock().expect("durable store mutex poisoned");
        let tmp_path = self.path.with_extension("bin.tmp");
        let file = File::create(&tmp_path).map_err(|_| DurableStoreError::Io)?;
        {
            let mut writer = BufWriter::new(file);
            bincode_options()
                .serialize_into(&mut writer, snapshot)
                .map_err(|_| DurableStoreError::Serde)?;
            use std::io::Write;
            writer.flush().map_err(|_| DurableStoreError::Io)?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|_| DurableStoreError::Io)?;
        Ok(())
    }
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_little_endian()
}
