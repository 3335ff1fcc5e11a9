use serde::{Deserialize, Serialize};

/// The log command type replicated by Raft for this service. Each variant corresponds to one
/// of the mutating RPCs; `MessagingCommand` values are never constructed anywhere but on the
/// leader, which assigns ids and timestamps before proposing them.
///
/// `Login` is replicated (rather than mutating only the handling node's in-memory session
/// map) so that a session survives a leader failover: every node ends up with the same
/// session entry once the command commits.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessagingCommand {
    CreateAccount {
        user_id: u32,
        username: String,
        credential: Vec<u8>,
    },
    DeleteAccount {
        user_id: u32,
    },
    Login {
        user_id: u32,
        token: String,
        expires_at_unix_secs: i64,
    },
    SendMessage {
        message_id: u32,
        sender_id: u32,
        receiver_id: u32,
        content: String,
        timestamp_unix_secs: i64,
    },
    MarkRead {
        user_id: u32,
        message_id: u32,
    },
    /// The leader selects which unread ids to dequeue (FIFO, up to the caller's requested
    /// count) before proposing, so the exact result can be handed back once this commits and
    /// every replica's apply is a deterministic replay of the same selection.
    ReadMessages {
        user_id: u32,
        message_ids: Vec<u32>,
    },
    DeleteMessage {
        message_id: u32,
    },
}

impl MessagingCommand {
    /// Serializes this command for the wire. Raft treats the result as an opaque blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("MessagingCommand is always serializable")
    }

    /// Deserializes a command previously produced by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        bincode::deserialize(bytes).expect("corrupt MessagingCommand on the wire")
    }
}
