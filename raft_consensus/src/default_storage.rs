use crate::PersistentStorageError;

use super::common::{LogCommand, LogEntry, LogIndex, PersistentStorage, ServerId, TermIndex};
use std::fmt::Debug;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Serialize, Deserialize)]
struct Election {
    current_term: TermIndex,
    voted_for: Option<(TermIndex, ServerId)>,
}

type WALBincodeOptions = bincode::config::WithOtherEndian<
    bincode::config::WithOtherIntEncoding<
        bincode::config::WithOtherTrailing<
            bincode::config::WithOtherLimit<
                bincode::config::DefaultOptions,
                bincode::config::Bounded,
            >,
            bincode::config::RejectTrailing,
        >,
        bincode::config::VarintEncoding,
    >,
    bincode::config::LittleEndian,
>;
#[inline]
fn get_election_bincode() -> WALBincodeOptions {
    bincode::DefaultOptions::new()
        .with_limit(std::mem::size_of::<Election>().try_into().unwrap())
        .reject_trailing_bytes()
        .with_varint_encoding()
        .with_little_endian()
}

/// Unbounded bincode options for (de)serializing individual log entries, whose encoded size
/// varies with the command payload.
#[inline]
fn get_log_entry_bincode() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_little_endian()
}

/// Persistent storage for Raft metadata (current term, vote) and the replicated log.
/// Should only ever be used from a single thread (the owning node's control loop).
#[derive(Debug)]
pub struct DefaultPersistentStorage<C: LogCommand> {
    election: Election,
    election_writer: BufWriter<File>,
    log_path: PathBuf,
    log_entries: Vec<LogEntry<C>>,
}
impl<C: LogCommand + Serialize + DeserializeOwned> DefaultPersistentStorage<C> {
    pub fn new(data_dir: &Path) -> Self {
        std::fs::create_dir_all(data_dir)
            .expect("OPEN STORAGE: Could not create data directory!");

        let (election, election_writer) = Self::open_election_file(data_dir);
        let log_path = data_dir.join("log.bin");
        let log_entries = Self::load_log(&log_path);

        DefaultPersistentStorage {
            election,
            election_writer,
            log_path,
            log_entries,
        }
    }

    fn open_election_file(data_dir: &Path) -> (Election, BufWriter<File>) {
        let file_size: usize = std::mem::size_of::<Election>();
        let election_file_exists = data_dir.join("election").exists();
        let (reader, mut writer) = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(data_dir.join("election"))
            .and_then(|f| f.set_len(file_size as u64).map(|_| f))
            .and_then(|f| {
                f.try_clone()
                    .map(|f_cloned| (BufReader::new(f), BufWriter::new(f_cloned)))
            })
            .expect("OPEN ELEC FILE: Could not open election file and set file size!");

        if election_file_exists {
            let header = get_election_bincode()
                .deserialize_from(reader)
                .expect("OPEN ELEC FILE: Could not deserialize election file!");
            (header, writer)
        } else {
            let election = Election {
                current_term: TermIndex(0),
                voted_for: None,
            };
            Self::write_election_state(&election, &mut writer)
                .expect("OPEN ELEC FILE: Could not write initial state to election file!");
            writer
                .flush()
                .expect("OPEN ELEC FILE: Could not fsync header to WAL!");
            (election, writer)
        }
    }

    fn write_election_state(
        election: &Election,
        election_writer: &mut BufWriter<File>,
    ) -> Result<(), PersistentStorageError> {
        election_writer
            .rewind()
            .map_err(|_| PersistentStorageError::IoError)?;
        get_election_bincode()
            .serialize_into(election_writer, election)
            .map_err(|_| PersistentStorageError::IoError)?;
        Ok(())
    }

    /// Loads the whole log into memory. Entries are length-prefixed bincode records; a
    /// short/corrupt trailing record (e.g. from a crash mid-write) is treated as the end of
    /// the log rather than a fatal error, since only a fully-written record could ever have
    /// been acknowledged to a peer.
    fn load_log(log_path: &Path) -> Vec<LogEntry<C>> {
        let Ok(file) = File::open(log_path) else {
            return Vec::new();
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            match get_log_entry_bincode().deserialize_from::<_, LogEntry<C>>(&mut reader) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
        }
        entries
    }

    /// Rewrites the log file from scratch to match the in-memory cache. Simpler and more
    /// robust than in-place truncation, at the cost of an O(n) rewrite on every truncating
    /// append; acceptable for a log of this system's expected size.
    fn persist_log(&self) -> Result<(), PersistentStorageError> {
        let tmp_path = self.log_path.with_extension("bin.tmp");
        let file = File::create(&tmp_path).map_err(|_| PersistentStorageError::IoError)?;
        let mut writer = BufWriter::new(file);
        for entry in &self.log_entries {
            get_log_entry_bincode()
                .serialize_into(&mut writer, entry)
                .map_err(|_| PersistentStorageError::SerdeError)?;
        }
        writer.flush().map_err(|_| PersistentStorageError::IoError)?;
        drop(writer);
        std::fs::rename(&tmp_path, &self.log_path).map_err(|_| PersistentStorageError::IoError)?;
        Ok(())
    }
}

impl<C: LogCommand + Serialize + DeserializeOwned> PersistentStorage<C> for DefaultPersistentStorage<C> {
    fn voted_for_in_current_term(&self) -> Option<ServerId> {
        self.election
            .voted_for
            .and_then(|(last_vote_term, server_id)| {
                if last_vote_term == self.election.current_term {
                    Some(server_id)
                } else {
                    None
                }
            })
    }

    fn update_term(&mut self, term: TermIndex) -> &mut Self {
        self.election.current_term = term;
        self
    }

    fn record_vote(&mut self, voted_for: ServerId) -> &mut Self {
        self.election.voted_for = Some((self.current_term(), voted_for));
        self
    }

    fn sync(&mut self) -> Result<(), PersistentStorageError> {
        Self::write_election_state(&self.election, &mut self.election_writer)?;
        self.election_writer
            .flush()
            .map_err(|_| PersistentStorageError::IoError)?;
        self.persist_log()
    }

    fn current_term(&self) -> TermIndex {
        self.election.current_term
    }

    fn last_entry_index_and_term(&self) -> Option<(LogIndex, TermIndex)> {
        self.log_entries.last().map(|e| (e.index, e.term))
    }

    fn term_at(&self, index: LogIndex) -> Option<TermIndex> {
        self.entry_at(index).map(|e| e.term)
    }

    fn entry_at(&self, index: LogIndex) -> Option<LogEntry<C>> {
        if index == LogIndex::BEFORE_FIRST {
            return None;
        }
        self.log_entries.get(index.as_usize()).cloned()
    }

    fn entries_from(&self, index: LogIndex) -> Vec<LogEntry<C>> {
        let start = index.as_usize();
        if start >= self.log_entries.len() {
            return Vec::new();
        }
        self.log_entries[start..].to_vec()
    }

    /// Appends new entries, first deleting any conflicting entries (same index, different
    /// term) and everything after them. An entry already present with a matching term is
    /// left as-is (idempotent with respect to retries/duplicate deliveries).
    fn append(&mut self, entries: Vec<LogEntry<C>>) -> &mut Self {
        for entry in entries {
            let position = entry.index.as_usize();
            match self.log_entries.get(position) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    self.log_entries.truncate(position);
                    self.log_entries.push(entry);
                }
                None => {
                    debug_assert_eq!(
                        position,
                        self.log_entries.len(),
                        "append should never leave a gap in the log"
                    );
                    self.log_entries.push(entry);
                }
            }
        }
        self
    }

    fn truncate_from(&mut self, index: LogIndex) -> &mut Self {
        self.log_entries.truncate(index.as_usize());
        self
    }
}
