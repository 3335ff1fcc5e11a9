//! In-memory indices over users, messages, conversations, unread queues and session tokens.
//! A pure function of the prefix of the Raft log that has been applied; rebuilt from the
//! durable store's snapshot at startup and mutated only by `MessagingCommandApplier`.

use std::collections::{BTreeSet, HashMap, VecDeque};

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub credential: Vec<u8>,
    pub unread: VecDeque<u32>,
    /// Most recent conversant first, deduplicated.
    pub recent_conversants: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub uid: u32,
    pub sender_id: u32,
    pub receiver_id: u32,
    pub content: String,
    pub read: bool,
    pub timestamp_unix_secs: i64,
    /// Monotonic creation order, distinct from `uid` (which may be reused after a delete).
    /// Used to rebuild the conversation index in original order after a restart.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Session {
    pub token: SessionToken,
    pub expires_at_unix_secs: i64,
}

pub type SessionToken = [u8; 16];

/// Durable snapshot handed to/from the storage layer. Mirrors what gets rebuilt on startup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub users: Vec<User>,
    pub messages: Vec<Message>,
    pub sessions: Vec<(u32, Session)>,
    pub next_user_id: u32,
    pub next_message_id: u32,
    pub next_message_seq: u64,
}

impl Default for Snapshot {
    /// User and message ids start at 1; 0 is never assigned.
    fn default() -> Self {
        Snapshot {
            users: Vec::new(),
            messages: Vec::new(),
            sessions: Vec::new(),
            next_user_id: 1,
            next_message_id: 1,
            next_message_seq: 0,
        }
    }
}

/// Key for a conversation between two users: the sorted pair, so both participants map to
/// the same entry regardless of who sent the most recent message.
pub fn conversation_key(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Default)]
pub struct AppState {
    users: HashMap<u32, User>,
    usernames: HashMap<String, u32>,
    next_user_id: u32,
    tombstoned_user_ids: BTreeSet<u32>,

    messages: HashMap<u32, Message>,
    next_message_id: u32,
    next_message_seq: u64,
    tombstoned_message_ids: BTreeSet<u32>,

    conversations: HashMap<(u32, u32), Vec<u32>>,
    sessions: HashMap<u32, Session>,
}

impl AppState {
    /// User and message ids start at 1; 0 is never assigned.
    pub fn new() -> Self {
        AppState {
            next_user_id: 1,
            next_message_id: 1,
            ..Default::default()
        }
    }

    /// Rebuilds every in-memory index from a durable snapshot, per the reconstruction order:
    /// users, then messages (rebuilding the conversation index and unread queues), then
    /// non-expired sessions.
    pub fn from_snapshot(snapshot: Snapshot, now_unix_secs: i64) -> Self {
        let mut state = AppState {
            next_user_id: snapshot.next_user_id,
            next_message_id: snapshot.next_message_id,
            next_message_seq: snapshot.next_message_seq,
            ..Default::default()
        };

        for user in snapshot.users {
            state.usernames.insert(user.username.clone(), user.id);
            state.users.insert(user.id, user);
        }

        let mut messages = snapshot.messages;
        messages.sort_by_key(|m| m.seq);
        for message in messages {
            state
                .conversations
                .entry(conversation_key(message.sender_id, message.receiver_id))
                .or_default()
                .push(message.uid);
            state.messages.insert(message.uid, message);
        }

        for (user_id, session) in snapshot.sessions {
            if session.expires_at_unix_secs > now_unix_secs {
                state.sessions.insert(user_id, session);
            }
        }

        state.recompute_tombstones();
        state
    }

    fn recompute_tombstones(&mut self) {
        self.tombstoned_user_ids = (1..self.next_user_id)
            .filter(|id| !self.users.contains_key(id))
            .collect();
        self.tombstoned_message_ids = (1..self.next_message_id)
            .filter(|id| !self.messages.contains_key(id))
            .collect();
    }

    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            users: self.users.values().cloned().collect(),
            messages: self.messages.values().cloned().collect(),
            sessions: self
                .sessions
                .iter()
                .map(|(id, session)| (*id, *session))
                .collect(),
            next_user_id: self.next_user_id,
            next_message_id: self.next_message_id,
            next_message_seq: self.next_message_seq,
        }
    }

    /// Reports the id `insert_user` would assign to the next user, reusing the lowest
    /// tombstoned id if any are free. Read-only: the leader calls this before proposing a
    /// `CreateAccount` command so the exact id is baked into the log entry and every replica
    /// converges on the same value when it applies `insert_user`.
    pub fn peek_next_user_id(&self) -> u32 {
        self.tombstoned_user_ids
            .iter()
            .next()
            .copied()
            .unwrap_or(self.next_user_id)
    }

    /// Reports the uid `insert_message` would assign to the next message, reusing the lowest
    /// tombstoned uid if any are free. Read-only, mirroring `peek_next_user_id`.
    pub fn peek_next_message_id(&self) -> u32 {
        self.tombstoned_message_ids
            .iter()
            .next()
            .copied()
            .unwrap_or(self.next_message_id)
    }

    pub fn next_message_seq(&mut self) -> u64 {
        let seq = self.next_message_seq;
        self.next_message_seq += 1;
        seq
    }

    pub fn username_exists(&self, username: &str) -> bool {
        self.usernames.contains_key(username)
    }

    /// Inserts a user whose id was already decided (via `peek_next_user_id`, baked into the
    /// replicated command) and advances the id counter/tombstones deterministically so every
    /// replica applying the same command ends up with identical state.
    pub fn insert_user(&mut self, user: User) {
        self.tombstoned_user_ids.remove(&user.id);
        self.next_user_id = self.next_user_id.max(user.id + 1);
        self.usernames.insert(user.username.clone(), user.id);
        self.users.insert(user.id, user);
    }

    pub fn remove_user(&mut self, user_id: u32) -> Option<User> {
        self.sessions.remove(&user_id);
        let user = self.users.remove(&user_id)?;
        self.usernames.remove(&user.username);
        self.tombstoned_user_ids.insert(user_id);
        Some(user)
    }

    pub fn user(&self, user_id: u32) -> Option<&User> {
        self.users.get(&user_id)
    }

    pub fn user_by_username(&self, username: &str) -> Option<&User> {
        self.usernames.get(username).and_then(|id| self.users.get(id))
    }

    /// `*` matches any run of characters, `?` matches exactly one. An empty pattern matches
    /// every account.
    pub fn accounts_matching(&self, pattern: &str) -> Vec<(u32, String)> {
        if pattern.is_empty() {
            let mut all: Vec<_> = self
                .users
                .values()
                .map(|u| (u.id, u.username.clone()))
                .collect();
            all.sort_by_key(|(id, _)| *id);
            return all;
        }
        let regex = wildcard_to_regex(pattern);
        let mut matches: Vec<_> = self
            .users
            .values()
            .filter(|u| regex.is_match(&u.username))
            .map(|u| (u.id, u.username.clone()))
            .collect();
        matches.sort_by_key(|(id, _)| *id);
        matches
    }

    pub fn record_login(&mut self, user_id: u32, token: SessionToken, expires_at_unix_secs: i64) {
        self.sessions.insert(
            user_id,
            Session {
                token,
                expires_at_unix_secs,
            },
        );
    }

    pub fn session_is_valid(&self, user_id: u32, token: &SessionToken, now_unix_secs: i64) -> bool {
        matches!(self.sessions.get(&user_id), Some(session) if &session.token == token && session.expires_at_unix_secs > now_unix_secs)
    }

    /// Inserts a message whose uid was already decided (via `peek_next_message_id`, baked
    /// into the replicated command) and advances the uid counter/tombstones deterministically
    /// so every replica applying the same command ends up with identical state.
    pub fn insert_message(&mut self, message: Message) {
        self.tombstoned_message_ids.remove(&message.uid);
        self.next_message_id = self.next_message_id.max(message.uid + 1);
        self.conversations
            .entry(conversation_key(message.sender_id, message.receiver_id))
            .or_default()
            .push(message.uid);
        let receiver_id = message.receiver_id;
        let message_uid = message.uid;
        self.messages.insert(message_uid, message);

        if let Some(receiver) = self.users.get_mut(&receiver_id) {
            receiver.unread.push_back(message_uid);
        }
        self.touch_conversants(message_uid);
    }

    fn touch_conversants(&mut self, message_uid: u32) {
        let Some(message) = self.messages.get(&message_uid) else {
            return;
        };
        let (sender_id, receiver_id) = (message.sender_id, message.receiver_id);
        if let Some(sender) = self.users.get_mut(&sender_id) {
            push_recent_conversant(&mut sender.recent_conversants, receiver_id);
        }
        if let Some(receiver) = self.users.get_mut(&receiver_id) {
            push_recent_conversant(&mut receiver.recent_conversants, sender_id);
        }
    }

    pub fn message(&self, uid: u32) -> Option<&Message> {
        self.messages.get(&uid)
    }

    pub fn conversation(&self, user_a: u32, user_b: u32) -> Vec<&Message> {
        self.conversations
            .get(&conversation_key(user_a, user_b))
            .map(|uids| uids.iter().filter_map(|uid| self.messages.get(uid)).collect())
            .unwrap_or_default()
    }

    /// Flips a message's read flag and drops it from its receiver's unread queue. A no-op if
    /// the message doesn't exist.
    pub fn mark_read(&mut self, user_id: u32, message_uid: u32) {
        if let Some(message) = self.messages.get_mut(&message_uid) {
            message.read = true;
        } else {
            return;
        }
        if let Some(user) = self.users.get_mut(&user_id) {
            user.unread.retain(|uid| *uid != message_uid);
        }
    }

    /// Peeks up to `max_messages` of `user_id`'s unread ids in FIFO order, without mutating
    /// anything. The leader calls this to decide exactly which ids a `ReadMessages` command
    /// will dequeue before proposing it.
    pub fn peek_unread(&self, user_id: u32, max_messages: u32) -> Vec<u32> {
        self.users
            .get(&user_id)
            .map(|u| u.unread.iter().take(max_messages as usize).copied().collect())
            .unwrap_or_default()
    }

    /// Dequeues the given ids from `user_id`'s unread queue and flips each one's read flag.
    /// Ids no longer present (already read or deleted by a racing command) are skipped.
    pub fn read_messages(&mut self, user_id: u32, message_ids: &[u32]) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.unread.retain(|uid| !message_ids.contains(uid));
        }
        for uid in message_ids {
            if let Some(message) = self.messages.get_mut(uid) {
                message.read = true;
            }
        }
    }

    pub fn unread_messages(&self, user_id: u32) -> Vec<u32> {
        self.users
            .get(&user_id)
            .map(|u| u.unread.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Removes a message from the conversation index, any receiver's unread queue, and the
    /// message table, tombstoning its uid for reuse.
    pub fn delete_message(&mut self, message_uid: u32) {
        let Some(message) = self.messages.remove(&message_uid) else {
            return;
        };
        if let Some(uids) = self
            .conversations
            .get_mut(&conversation_key(message.sender_id, message.receiver_id))
        {
            uids.retain(|uid| *uid != message_uid);
        }
        if let Some(receiver) = self.users.get_mut(&message.receiver_id) {
            receiver.unread.retain(|uid| *uid != message_uid);
        }
        self.tombstoned_message_ids.insert(message_uid);
    }
}

fn push_recent_conversant(conversants: &mut Vec<u32>, other: u32) {
    conversants.retain(|id| *id != other);
    conversants.insert(0, other);
}

fn wildcard_to_regex(pattern: &str) -> Regex {
    let mut regex_src = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex_src.push_str(".*"),
            '?' => regex_src.push('.'),
            _ => regex_src.push_str(&regex::escape(&ch.to_string())),
        }
    }
    regex_src.push('$');
    Regex::new(&regex_src).expect("wildcard pattern always compiles to a valid regex")
}
