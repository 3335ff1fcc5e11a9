pub use crate::common::*;
pub use crate::default_storage::DefaultPersistentStorage;
use crate::rpc_messages::RpcMessage;
use crate::state_machine::*;
use crate::system_clock;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use std::{thread, vec};

use crate::common::RaftTransportBridge;

use tracing::{debug, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftNodeState {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStateEvent {
    pub server_id: ServerId,
    pub current_state: RaftNodeState,
    pub current_term: TermIndex,
    pub voted_for: Option<ServerId>,
    pub leader_for_term: Option<ServerId>,
}

pub trait RaftStateEventCollector: Send {
    fn push_event(&mut self, event: RaftStateEvent);
}

pub struct NoOpRaftEventCollector;
impl RaftStateEventCollector for NoOpRaftEventCollector {
    fn push_event(&mut self, _event: RaftStateEvent) {}
}

/// A snapshot of what a node currently believes about its own role and the cluster leader,
/// refreshed once per control-loop iteration. Read by the Service Façade to answer
/// `LeaderPing` and to decide whether to redirect a mutation without waiting on the slower
/// client-command path.
#[derive(Debug, Clone, Copy)]
pub struct RaftStatusSnapshot {
    pub role: RaftNodeState,
    pub current_term: TermIndex,
    pub leader_hint: Option<ServerId>,
}

impl RaftStatusSnapshot {
    fn initial() -> Self {
        RaftStatusSnapshot {
            role: RaftNodeState::Follower,
            current_term: TermIndex(0),
            leader_hint: None,
        }
    }
}

/// Shared, lock-protected handle to the latest `RaftStatusSnapshot`.
pub type SharedRaftStatus = Arc<Mutex<RaftStatusSnapshot>>;

/// A command a client (the Service Façade) wants replicated through the Raft log.
pub struct ClientCommandSubmission<C: LogCommand> {
    pub command: C,
    pub respond_to: oneshot::Sender<ClientCommandResult>,
}

/// Outcome of submitting a client command to this node.
#[derive(Debug, Clone)]
pub enum ClientCommandResult {
    /// This node was the leader and appended the command at the given log index. The caller
    /// still needs to wait (via `CommitStatus`) for that index to be committed and applied.
    Accepted { index: LogIndex },
    /// This node is not the leader.
    NotLeader { leader_hint: Option<ServerId> },
}

/// Lets callers outside the Raft thread (the Service Façade) wait for a log index to be
/// applied to the application state machine, bounded by a timeout.
pub struct CommitStatus {
    state: Mutex<(LogIndex, LogIndex)>,
    condvar: Condvar,
}

impl CommitStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(CommitStatus {
            state: Mutex::new((LogIndex::BEFORE_FIRST, LogIndex::BEFORE_FIRST)),
            condvar: Condvar::new(),
        })
    }

    fn publish(&self, commit_index: LogIndex, last_applied: LogIndex) {
        let mut state = self.state.lock().expect("CommitStatus mutex poisoned");
        *state = (commit_index, last_applied);
        self.condvar.notify_all();
    }

    /// Blocks the calling thread until `index` has been applied, or `timeout` elapses.
    /// Returns whether it was applied in time.
    pub fn wait_until_applied(&self, index: LogIndex, timeout: Duration) -> bool {
        let mut state = self.state.lock().expect("CommitStatus mutex poisoned");
        if state.1 >= index {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return state.1 >= index;
            }
            let (new_state, wait_result) = self
                .condvar
                .wait_timeout(state, remaining)
                .expect("CommitStatus mutex poisoned");
            state = new_state;
            if state.1 >= index {
                return true;
            }
            if wait_result.timed_out() {
                return state.1 >= index;
            }
        }
    }
}

pub fn start_raft_in_new_thread<LC, A>(
    server_id: ServerId,
    other_servers: HashSet<ServerId>,
    storage_path: String,
    config: RaftConfig,
    mut rng: ChaCha8Rng,
    mut transport: impl RaftTransportBridge<LC> + 'static,
    mut event_collector: impl RaftStateEventCollector + 'static,
    client_command_rx: mpsc::Receiver<ClientCommandSubmission<LC>>,
    mut applier: A,
    commit_status: Arc<CommitStatus>,
    status: SharedRaftStatus,
) -> thread::JoinHandle<()>
where
    LC: LogCommand + Serialize + DeserializeOwned + 'static,
    A: CommandApplier<LC> + 'static,
{
    thread::spawn(move || {
        let start_time = system_clock::now();

        let mut storage = DefaultPersistentStorage::new(Path::new(&storage_path));

        let (mut state, first_tick_timer) = Node::new(server_id, other_servers, &config, &mut rng);
        info!(
            "{:?}: Starting raft node with state: {:?}, term: {:?}",
            server_id,
            match state {
                Node::Follower(_) => RaftNodeState::Follower,
                Node::Candidate(_) => RaftNodeState::Candidate,
                Node::Leader(_) => RaftNodeState::Leader,
            },
            storage.current_term(),
        );

        *status.lock().expect("status mutex poisoned") = RaftStatusSnapshot::initial();

        let mut interval_until_next_timer_expires = first_tick_timer.0;
        loop {
            trace!(
                "Waiting {:?}ms for next message at time {:?}...",
                interval_until_next_timer_expires.as_millis(),
                start_time.elapsed().as_millis(),
            );

            let time_before_waiting = system_clock::now();
            let maybe_next_message =
                transport.wait_for_next_incoming_message(interval_until_next_timer_expires);

            trace!(
                "Got next message: {:?} after waiting for {:?}, time is now {:?}",
                maybe_next_message,
                time_before_waiting.elapsed().as_millis(),
                start_time.elapsed().as_millis(),
            );

            let (mut new_state, mut tick_actions) = match state.next(
                Event::Tick(system_clock::now()),
                &mut storage,
                &config,
                &mut rng,
            ) {
                Ok((new_state, actions)) => (new_state, actions),
                Err(_) => {
                    info!("Persistent storage error, shutting down raft thread...");
                    break;
                }
            };

            if maybe_next_message.is_err() {
                info!("Transport shutdown, shutting down raft thread...");
                break;
            }

            let mut actions_after_processing_message =
                if let Ok(Some(incoming_message)) = maybe_next_message {
                    let actions;
                    (new_state, actions) = match new_state.next(
                        Event::IncomingRpc(incoming_message),
                        &mut storage,
                        &config,
                        &mut rng,
                    ) {
                        Ok((new_state, actions)) => (new_state, actions),
                        Err(_) => {
                            info!("Persistent storage error, shutting down raft thread...");
                            break;
                        }
                    };
                    actions
                } else {
                    vec![]
                };

            interval_until_next_timer_expires = interval_until_next_timer_expires
                .checked_sub(time_before_waiting.elapsed())
                .unwrap_or(Duration::from_millis(0));

            let mut transport_shutdown = false;
            for action in tick_actions
                .drain(..)
                .chain(actions_after_processing_message.drain(..))
            {
                match action {
                    Action::OutgoingRpc(RpcMessage::Request(r)) => {
                        if transport.enqueue_outgoing_request(r).is_err() {
                            transport_shutdown = true;
                        }
                    }
                    Action::OutgoingRpc(RpcMessage::Reply(message)) => {
                        if transport.enqueue_reply(message).is_err() {
                            transport_shutdown = true;
                        }
                    }
                    Action::SetNextTimeout(timer_duration) => {
                        trace!("Setting next tick timeout to {:?}", timer_duration);
                        interval_until_next_timer_expires = timer_duration;
                    }
                }
            }
            if transport_shutdown {
                info!("Transport shutdown, shutting down raft thread...");
                break;
            }

            // Accept any client commands waiting on us. Only the leader can append; everyone
            // else bounces them back with a redirect hint so the caller can retry elsewhere.
            while let Ok(submission) = client_command_rx.try_recv() {
                let result = if new_state.is_leader() {
                    let next_index = storage
                        .last_entry_index_and_term()
                        .map(|(index, _)| index.next())
                        .unwrap_or(LogIndex(0));
                    storage.append(vec![LogEntry {
                        index: next_index,
                        term: storage.current_term(),
                        command: submission.command,
                    }]);
                    if storage.sync().is_err() {
                        info!("Persistent storage error appending client command, shutting down raft thread...");
                        return;
                    }
                    ClientCommandResult::Accepted { index: next_index }
                } else {
                    ClientCommandResult::NotLeader {
                        leader_hint: new_state.leader_hint(),
                    }
                };
                let _ = submission.respond_to.send(result);
            }

            // Apply any entries that are now known to be committed, strictly in order.
            while new_state.last_applied() < new_state.commit_index() {
                let next_index = new_state.last_applied().next();
                match storage.entry_at(next_index) {
                    Some(entry) => {
                        applier.apply(next_index, &entry.command);
                        new_state.set_last_applied(next_index);
                    }
                    None => {
                        debug!(
                            "{:?}: commit index {:?} advanced past available log entries, will retry",
                            server_id,
                            new_state.commit_index()
                        );
                        break;
                    }
                }
            }
            commit_status.publish(new_state.commit_index(), new_state.last_applied());

            *status.lock().expect("status mutex poisoned") = RaftStatusSnapshot {
                role: match new_state {
                    Node::Follower(_) => RaftNodeState::Follower,
                    Node::Candidate(_) => RaftNodeState::Candidate,
                    Node::Leader(_) => RaftNodeState::Leader,
                },
                current_term: storage.current_term(),
                leader_hint: new_state.leader_hint(),
            };

            event_collector.push_event(RaftStateEvent {
                server_id,
                current_state: match new_state {
                    Node::Follower(_) => RaftNodeState::Follower,
                    Node::Candidate(_) => RaftNodeState::Candidate,
                    Node::Leader(_) => RaftNodeState::Leader,
                },
                current_term: storage.current_term(),
                voted_for: storage.voted_for_in_current_term(),
                leader_for_term: new_state.leader_hint(),
            });

            state = new_state;
        }
    })
}
