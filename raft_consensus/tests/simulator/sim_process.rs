use std::{
    collections::HashSet,
    sync::{mpsc, Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use raft_consensus::{
    start_raft_in_new_thread, ClientCommandResult, ClientCommandSubmission, CommitStatus,
    NoOpCommandApplier, RaftConfig, RaftNodeState, RaftStateEventCollector, RaftStatusSnapshot,
    ServerId, SharedRaftStatus, TermIndex,
};
use rand_chacha::ChaCha8Rng;

use super::common::SimLogCommand;
use super::sim_network::SimNetwork;

/// A process in the simulation that represents a single server.
/// This runs the Raft algorithm for this simulated server in it's own thread.
/// It uses the provided transport to send and to receive messages from other servers.
/// Committed entries are applied with a no-op applier; these tests exercise consensus, not
/// application state, so `submit_command` and `commit_status` are what tests use to observe
/// replication.
pub(crate) struct SimRaftProcess {
    pub(crate) thread_handle: JoinHandle<()>,
    client_command_tx: mpsc::Sender<ClientCommandSubmission<SimLogCommand>>,
    pub(crate) commit_status: Arc<CommitStatus>,
    pub(crate) status: SharedRaftStatus,
}
impl SimRaftProcess {
    pub(crate) fn new(
        server_id: ServerId,
        max_id: u64,
        config: RaftConfig,
        storage_path: String,
        mut rng: ChaCha8Rng,
        network: &mut SimNetwork,
        event_collector: impl RaftStateEventCollector + 'static,
    ) -> Self {
        rng.set_stream(server_id.0 as u64);
        assert!(
            server_id.0 <= max_id,
            "Server ID must be less than/equal to max ID"
        );

        let mut other_servers = HashSet::new();
        for s in 0..max_id {
            if s != server_id.0 {
                other_servers.insert(ServerId(s));
            }
        }

        let transport = network.join_network_and_take_transport_connector(server_id);
        let (client_command_tx, client_command_rx) = mpsc::channel();
        let commit_status = CommitStatus::new();
        let status: SharedRaftStatus = Arc::new(Mutex::new(RaftStatusSnapshot {
            role: RaftNodeState::Follower,
            current_term: TermIndex(0),
            leader_hint: None,
        }));

        let raft_thread_handle = start_raft_in_new_thread(
            server_id,
            other_servers,
            storage_path,
            config,
            rng,
            transport,
            event_collector,
            client_command_rx,
            NoOpCommandApplier,
            commit_status.clone(),
            status.clone(),
        );
        SimRaftProcess {
            thread_handle: raft_thread_handle,
            client_command_tx,
            commit_status,
            status,
        }
    }

    pub(crate) fn tick(&self) {
        self.thread_handle.thread().unpark();
    }

    pub(crate) fn wake_up_transport_connector(&self) {
        self.thread_handle.thread().unpark();
    }

    /// No-op: this simulator does not model process crash/restart.
    pub(crate) fn restart_if_needed(&mut self, _network: &mut SimNetwork) {}

    /// Submits a command to this node and returns how it was handled (accepted with a log
    /// index, or a not-leader redirect). Does not wait for the command to commit; callers
    /// should wait on `commit_status` separately.
    pub(crate) fn submit_command(&self, command: SimLogCommand) -> Option<ClientCommandResult> {
        let (respond_to, response) = oneshot::channel();
        self.client_command_tx
            .send(ClientCommandSubmission {
                command,
                respond_to,
            })
            .ok()?;
        response.recv_timeout(Duration::from_secs(1)).ok()
    }
}
