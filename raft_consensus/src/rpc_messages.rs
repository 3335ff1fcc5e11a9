//! Message types exchanged between Raft nodes over whatever `RaftTransportBridge`
//! implementation is in use (real gRPC in production, an in-memory simulator in tests).

use crate::common::{LogCommand, LogEntry, LogIndex, ServerId, TermIndex};
use uuid::Uuid;

#[derive(Debug, Eq, PartialEq, Clone)]
/// A message flowing between Raft peers: either a request or a reply to one.
pub enum RpcMessage<C: LogCommand> {
    /// A request flowing from one server to another.
    Request(Request<C>),
    /// A reply flowing from one server back to the one that requested it.
    Reply(ReplyTo),
}

impl<C: LogCommand> RpcMessage<C> {
    /// The server that originated this message.
    pub fn from(&self) -> ServerId {
        match self {
            RpcMessage::Request(r) => r.from(),
            RpcMessage::Reply(r) => r.from(),
        }
    }

    /// The server this message is addressed to.
    pub fn to(&self) -> ServerId {
        match self {
            RpcMessage::Request(r) => r.to(),
            RpcMessage::Reply(r) => r.to(),
        }
    }

    /// Wraps an `AppendEntries` request.
    pub fn append_entries(req: AppendEntries<C>) -> Self {
        RpcMessage::Request(Request::AppendEntries(req))
    }

    /// Wraps a `RequestVote` request.
    pub fn request_vote(req: RequestVote) -> Self {
        RpcMessage::Request(Request::RequestVote(req))
    }

    /// Wraps a vote reply.
    pub fn vote(reply: Vote) -> Self {
        RpcMessage::Reply(ReplyTo::RequestVote(reply))
    }

    /// Wraps an `AppendEntries` ack reply.
    pub fn ack_append_entries(reply: AppendEntriesAck) -> Self {
        RpcMessage::Reply(ReplyTo::AppendEntries(reply))
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
/// The two kinds of requests exchanged between Raft peers.
pub enum Request<C: LogCommand> {
    /// Sent by a candidate to solicit a vote for an election term.
    RequestVote(RequestVote),
    /// Sent by the leader to replicate log entries and as a heartbeat.
    AppendEntries(AppendEntries<C>),
}

impl<C: LogCommand> Request<C> {
    /// The server that originated this request.
    pub fn from(&self) -> ServerId {
        match self {
            Request::RequestVote(r) => r.from,
            Request::AppendEntries(r) => r.from,
        }
    }

    /// The server this request is addressed to.
    pub fn to(&self) -> ServerId {
        match self {
            Request::RequestVote(r) => r.to,
            Request::AppendEntries(r) => r.to,
        }
    }

    /// The term carried by this request.
    pub fn term(&self) -> TermIndex {
        match self {
            Request::RequestVote(r) => r.term,
            Request::AppendEntries(r) => r.term,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
/// Sent by the leader to replicate entries to a follower and, with an empty `entries`,
/// as a heartbeat.
pub struct AppendEntries<C: LogCommand> {
    /// Correlates this request with its reply.
    pub request_id: Uuid,
    /// The leader sending this request.
    pub from: ServerId,
    /// The follower this request is addressed to.
    pub to: ServerId,
    /// The leader's current term.
    pub term: TermIndex,
    /// Index of the log entry immediately preceding `entries`. `LogIndex::BEFORE_FIRST` if
    /// `entries` starts at the beginning of the log.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: TermIndex,
    /// Log entries to append, in order. Empty for a pure heartbeat.
    pub entries: Vec<LogEntry<C>>,
    /// The leader's commit index, used by followers to advance their own.
    pub leader_commit: LogIndex,
}

#[derive(Debug, Eq, PartialEq, Clone)]
/// Sent by a candidate to solicit a vote.
pub struct RequestVote {
    /// Correlates this request with its reply.
    pub request_id: Uuid,
    /// The candidate sending this request.
    pub from: ServerId,
    /// The server this request is addressed to.
    pub to: ServerId,
    /// The candidate's term.
    pub term: TermIndex,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermIndex,
}

#[derive(Debug, Eq, PartialEq, Clone)]
/// The two kinds of replies exchanged between Raft peers.
pub enum ReplyTo {
    /// Reply to a `RequestVote`.
    RequestVote(Vote),
    /// Reply to an `AppendEntries`.
    AppendEntries(AppendEntriesAck),
}

impl ReplyTo {
    /// The server that originated this reply.
    pub fn from(&self) -> ServerId {
        match self {
            ReplyTo::RequestVote(v) => v.from,
            ReplyTo::AppendEntries(a) => a.from,
        }
    }

    /// The server this reply is addressed to.
    pub fn to(&self) -> ServerId {
        match self {
            ReplyTo::RequestVote(v) => v.to,
            ReplyTo::AppendEntries(a) => a.to,
        }
    }

    /// The term carried by this reply.
    pub fn term(&self) -> TermIndex {
        match self {
            ReplyTo::RequestVote(v) => v.term,
            ReplyTo::AppendEntries(a) => a.term,
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
/// Reply to an `AppendEntries` request.
pub struct AppendEntriesAck {
    /// Correlates this reply with its request.
    pub request_id: Uuid,
    /// The follower replying.
    pub from: ServerId,
    /// The leader this reply is addressed to.
    pub to: ServerId,
    /// The responder's current term, so the leader can detect it is stale.
    pub term: TermIndex,
    /// Whether the consistency check passed and the entries (if any) were appended.
    pub success: bool,
    /// The index of the last entry known to match between leader and follower after this
    /// request was processed. Only meaningful when `success` is true; the leader uses it to
    /// advance `next_index`/`match_index` for this peer without guessing.
    pub match_index: LogIndex,
}

#[derive(Debug, Eq, PartialEq, Clone)]
/// Reply to a `RequestVote` request.
pub struct Vote {
    /// Correlates this reply with its request.
    pub request_id: Uuid,
    /// The voter replying.
    pub from: ServerId,
    /// The candidate this reply is addressed to.
    pub to: ServerId,
    /// The voter's current term.
    pub term: TermIndex,
    /// Whether the vote was granted.
    pub vote_granted: bool,
}
