/// Common code (for example system clock abstraction that allows for mocking time)
pub mod system_clock;
pub use system_clock::now;
pub use system_clock::Instant;

use crate::rpc_messages::{ReplyTo, Request, RpcMessage};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Serialize, Deserialize, Hash)]
/// A unique identifier for a server in the cluster.
pub struct ServerId(pub u64);

/// A trait that defines the interface for a log command. Raft treats the command as an
/// opaque payload; it never inspects it beyond storing and replaying it in order.
pub trait LogCommand: Debug + Clone + Send + Eq + PartialEq {}
impl<T> LogCommand for T where T: Debug + Clone + Send + Eq + PartialEq {}

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Serialize, Deserialize, Hash)]
/// The index of a log entry. `-1` denotes "before the first entry" (an empty log's
/// predecessor), matching the external RPC contract where `prev_log_index = -1` is valid.
pub struct LogIndex(pub i64);
impl LogIndex {
    /// Sentinel for "the position before any entry has ever been appended".
    pub const BEFORE_FIRST: LogIndex = LogIndex(-1);

    /// The position immediately after this one.
    pub fn next(self) -> Self {
        LogIndex(self.0 + 1)
    }

    /// The position immediately before this one. Saturates at `BEFORE_FIRST`.
    pub fn prev(self) -> Self {
        LogIndex((self.0 - 1).max(-1))
    }

    /// This index as a 0-based offset into an in-memory cache of log entries.
    pub fn as_usize(self) -> usize {
        self.0.max(0) as usize
    }
}

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Serialize, Deserialize, Hash)]
/// The term of a log entry, or the current term of a node.
pub struct TermIndex(pub i64);
impl TermIndex {
    /// Returns the next term.
    pub fn increment(&mut self) -> Self {
        TermIndex(self.0 + 1)
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize)]
/// A log entry in the Raft log.
pub struct LogEntry<T: LogCommand> {
    /// The index of the log entry.
    pub index: LogIndex,
    /// The term of the log entry.
    pub term: TermIndex,
    /// The command that was applied to the state machine to produce this log entry.
    pub command: T,
}

#[derive(Debug, Clone, Copy)]
/// The configuration for a Raft node.
pub struct RaftConfig {
    /// The amount of time that a leader will wait before sending a heartbeat to its followers.
    pub leader_heartbeat_interval: Duration,
    /// The minimum amount of time that a follower will wait before becoming a candidate.
    pub min_election_timeout_ms: u32,
    /// The maximum amount of time that a follower will wait before becoming a candidate.
    pub max_election_timeout_ms: u32,
}

#[derive(Debug, Clone, Copy)]
/// Errors that can occur when interacting with the persistent storage layer. These are
/// treated as fatal by callers: a node cannot safely continue operating once it can no
/// longer durably record Raft metadata or log entries.
pub enum PersistentStorageError {
    /// An error occurred while reading from/writing to disk.
    IoError,
    /// An error occurred while serializing/deserializing data.
    SerdeError,
    /// The on-disk log or metadata file contained data that could not be reconciled with
    /// the in-memory cache (e.g. a short read, a truncated record).
    CorruptState,
}

/// A trait that defines the interface for a persistent storage layer for Raft.
///
/// Implementations must flush every mutating call to stable storage before `sync` returns.
/// The only caller is the single Raft control-loop thread, so implementations need no
/// internal locking.
pub trait PersistentStorage<C: LogCommand>: Send + Debug {
    /// Returns the current term of the Raft node.
    fn current_term(&self) -> TermIndex;
    /// Returns the server this node voted for in the current term, if any.
    fn voted_for_in_current_term(&self) -> Option<ServerId>;

    /// Updates the current term of the Raft node.
    fn update_term(&mut self, term: TermIndex) -> &mut Self;
    /// Records a vote cast in the current term.
    fn record_vote(&mut self, voted_for: ServerId) -> &mut Self;

    /// Returns the (index, term) of the last entry in the log, if the log is non-empty.
    fn last_entry_index_and_term(&self) -> Option<(LogIndex, TermIndex)>;
    /// Returns the term stored at `index`, if present.
    fn term_at(&self, index: LogIndex) -> Option<TermIndex>;
    /// Returns the entry stored at `index`, if present.
    fn entry_at(&self, index: LogIndex) -> Option<LogEntry<C>>;
    /// Returns all entries from `index` (inclusive) to the end of the log.
    fn entries_from(&self, index: LogIndex) -> Vec<LogEntry<C>>;

    /// Appends the given entries to the log. Any existing entry at a conflicting index/term
    /// is deleted along with everything that followed it before the new entries are written.
    /// Appending an entry that already exists with a matching term is a no-op for that entry.
    fn append(&mut self, entries: Vec<LogEntry<C>>) -> &mut Self;

    /// Deletes all entries from `index` (inclusive) onward.
    fn truncate_from(&mut self, index: LogIndex) -> &mut Self;

    /// Writes/fsyncs any pending changes to disk.
    fn sync(&mut self) -> Result<(), PersistentStorageError>;
}

#[derive(Debug)]
/// Enum of errors that can originate from the Raft transport code.
pub enum RaftTransportError {
    /// The transport was shutdown.
    TransportShutdown,
}

/// A trait that defines the interface for a network transport for Raft. This is used by the
/// Raft node to send and receive messages from other nodes. Using a trait for this allows us
/// to swap a different implementation for testing that uses a simulated network.
pub trait RaftTransportBridge<C: LogCommand>: Send {
    /// Returns the next incoming message from the network, waiting up to `max_wait`.
    fn wait_for_next_incoming_message(
        &mut self,
        max_wait: Duration,
    ) -> Result<Option<RpcMessage<C>>, RaftTransportError>;

    /// Enqueues a reply to be sent to the given server.
    fn enqueue_reply(&mut self, reply: ReplyTo) -> Result<(), RaftTransportError>;

    /// Enqueues a request to be sent to the given server.
    fn enqueue_outgoing_request(&mut self, request: Request<C>) -> Result<(), RaftTransportError>;
}

/// Implemented by the owning application's state machine. Raft calls `apply` once per
/// committed log entry, strictly in log order, and never re-applies an index once `apply`
/// has returned for it.
pub trait CommandApplier<C: LogCommand>: Send {
    /// Deterministically mutates application state from a committed command. Must not fail
    /// under normal operation; an unrecoverable error here is as fatal to the node as a
    /// `PersistentStorageError`.
    fn apply(&mut self, index: LogIndex, command: &C);
}

/// An applier that does nothing, for tests that only exercise leader election and
/// replication and have no application state to mutate.
#[derive(Debug, Default)]
pub struct NoOpCommandApplier;
impl<C: LogCommand> CommandApplier<C> for NoOpCommandApplier {
    fn apply(&mut self, _index: LogIndex, _command: &C) {}
}
