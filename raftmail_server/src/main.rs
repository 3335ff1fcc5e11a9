mod app_state;
mod command_applier;
mod config;
mod durable_store;
mod error;
mod service;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raft_consensus::{
    start_raft_in_new_thread, NoOpRaftEventCollector, RaftConfig, RaftNodeState,
    RaftStatusSnapshot, ServerId, TermIndex,
};
use raftmail_proto::messaging_server::MessagingServer;
use raftmail_transport::grpc_transport::RaftGrpcTransport;
use raftmail_transport::proto_convert::raft_consensus_server::RaftConsensusServer;
use tokio::select;
use tonic::transport::Server;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use clap::Parser;

use app_state::AppState;
use command_applier::MessagingCommandApplier;
use durable_store::DurableStore;
use service::MessagingServiceImpl;

/// Starts one node of the replicated messaging cluster.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// ID of this server; must match a key in the cluster config.
    #[arg(short, long)]
    server_id: u64,

    /// Port to listen on for both the client-facing and Raft-internal gRPC services.
    #[arg(short, long)]
    port: u16,

    /// Path to the JSON cluster config mapping server ids to "host:port" addresses.
    #[arg(short = 'c', long)]
    cluster_config: PathBuf,

    /// Directory to store the Raft write-ahead log and the durable application snapshot.
    #[arg(short = 'd', long)]
    data_dir: PathBuf,

    /// Leader heartbeat interval in milliseconds.
    #[arg(short = 'l', long, default_value_t = 50)]
    leader_heartbeat_ms: u64,

    /// Minimum election timeout in milliseconds.
    #[arg(long, default_value_t = 150)]
    min_election_timeout_ms: u32,

    /// Maximum election timeout in milliseconds.
    #[arg(long, default_value_t = 300)]
    max_election_timeout_ms: u32,

    /// How long a session stays valid after a successful login, in seconds.
    #[arg(long, default_value_t = 86_400)]
    session_ttl_secs: u64,

    /// How long a mutating RPC waits for its command to commit before returning Unavailable.
    #[arg(long, default_value_t = 5_000)]
    commit_wait_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let addr = std::net::SocketAddr::new(
        "0.0.0.0".parse().expect("SERVER INIT: could not parse bind IP"),
        args.port,
    );
    let server_id = ServerId(args.server_id);

    let cluster = config::load_cluster_config(&args.cluster_config);
    let other_servers = cluster
        .iter()
        .filter(|(id, _)| **id != server_id)
        .map(|(id, _)| *id)
        .collect();

    let mut raft_grpc_transport =
        RaftGrpcTransport::start_grpc_transport(server_id, cluster.clone()).await;
    let raft_config = RaftConfig {
        leader_heartbeat_interval: Duration::from_millis(args.leader_heartbeat_ms),
        min_election_timeout_ms: args.min_election_timeout_ms,
        max_election_timeout_ms: args.max_election_timeout_ms,
    };
    let rng = ChaCha8Rng::from_entropy();
    let event_collector = NoOpRaftEventCollector {};

    std::fs::create_dir_all(&args.data_dir).expect("SERVER INIT: could not create data directory");
    let store = Arc::new(DurableStore::new(&args.data_dir));
    let snapshot = store.load();
    let state = Arc::new(Mutex::new(AppState::from_snapshot(snapshot, now_unix_secs())));
    let applier = MessagingCommandApplier::new(state.clone(), store.clone());

    let (client_command_tx, client_command_rx) = std::sync::mpsc::channel();
    let commit_status = raft_consensus::CommitStatus::new();
    let status = Arc::new(Mutex::new(RaftStatusSnapshot {
        role: RaftNodeState::Follower,
        current_term: TermIndex(0),
        leader_hint: None,
    }));

    let wal_dir = args
        .data_dir
        .join("wal")
        .to_str()
        .expect("SERVER INIT: data dir path is not valid UTF-8")
        .to_string();

    let raft_thread = start_raft_in_new_thread(
        server_id,
        other_servers,
        wal_dir,
        raft_config,
        rng,
        raft_grpc_transport.transport_bridge,
        event_collector,
        client_command_rx,
        applier,
        commit_status.clone(),
        status.clone(),
    );
    raft_grpc_transport
        .grpc_server
        .register_raft_thread(raft_thread);

    let messaging = MessagingServiceImpl::new(
        state,
        client_command_tx,
        commit_status,
        status,
        cluster,
        Duration::from_millis(args.commit_wait_timeout_ms),
        Duration::from_secs(args.session_ttl_secs),
    );

    select! {
        _ = raft_grpc_transport.message_sender_task => {},
        _ = Server::builder()
            .add_service(RaftConsensusServer::new(raft_grpc_transport.grpc_server))
            .add_service(MessagingServer::new(messaging))
            .serve(addr) => {},
    }

    Ok(())
}

fn now_unix_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_secs() as i64
}
