//! Deterministically mutates `AppState` from committed log entries and writes the result
//! through to the `DurableStore` before advancing `last_applied`, per the Raft core's
//! `CommandApplier` contract.

use std::sync::{Arc, Mutex};

use raft_consensus::{CommandApplier, LogIndex};
use raftmail_transport::MessagingCommand;
use tracing::debug;

use crate::app_state::AppState;
use crate::durable_store::DurableStore;

pub type SharedAppState = Arc<Mutex<AppState>>;

pub struct MessagingCommandApplier {
    state: SharedAppState,
    store: Arc<DurableStore>,
}

impl MessagingCommandApplier {
    pub fn new(state: SharedAppState, store: Arc<DurableStore>) -> Self {
        MessagingCommandApplier { state, store }
    }
}

impl CommandApplier<MessagingCommand> for MessagingCommandApplier {
    fn apply(&mut self, index: LogIndex, command: &MessagingCommand) {
        let mut state = self.state.lock().expect("application state mutex poisoned");
        match command.clone() {
            MessagingCommand::CreateAccount {
                user_id,
                username,
                credential,
            } => {
                state.insert_user(crate::app_state::User {
                    id: user_id,
                    username,
                    credential,
                    unread: Default::default(),
                    recent_conversants: Vec::new(),
                });
            }
            MessagingCommand::DeleteAccount { user_id } => {
                state.remove_user(user_id);
            }
            MessagingCommand::Login {
                user_id,
                token,
                expires_at_unix_secs,
            } => {
                let mut token_bytes = [0u8; 16];
                let decoded = hex_decode(&token);
                token_bytes[..decoded.len().min(16)]
                    .copy_from_slice(&decoded[..decoded.len().min(16)]);
                state.record_login(user_id, token_bytes, expires_at_unix_secs);
            }
            MessagingCommand::SendMessage {
                message_id,
                sender_id,
                receiver_id,
                content,
                timestamp_unix_secs,
            } => {
                let seq = state.next_message_seq();
                state.insert_message(crate::app_state::Message {
                    uid: message_id,
                    sender_id,
                    receiver_id,
                    content,
                    read: false,
                    timestamp_unix_secs,
                    seq,
                });
            }
            MessagingCommand::MarkRead {
                user_id,
                message_id,
            } => state.mark_read(user_id, message_id),
            MessagingCommand::ReadMessages {
                user_id,
                message_ids,
            } => state.read_messages(user_id, &message_ids),
            MessagingCommand::DeleteMessage { message_id } => state.delete_message(message_id),
        }

        let snapshot = state.to_snapshot();
        drop(state);
        if let Err(err) = self.store.persist(&snapshot) {
            panic!("FATAL: could not persist application state at index {index:?}: {err:?}");
        }
        debug!("applied log index {:?}", index);
    }
}

/// Session tokens are generated as hex strings (see `service::new_session_token`); decodes
/// one back to raw bytes for the fixed-size in-memory comparison key.
fn hex_decode(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .filter_map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
