use crate::command::MessagingCommand;
use crate::grpc_transport::TransportMessage;
use crate::proto_convert::raft_consensus_server::RaftConsensus;
use crate::proto_convert::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use raft_consensus::rpc_messages;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tonic::{Request, Response, Status};

/// Raft gRPC server implementation. Forwards incoming RequestVote/AppendEntries RPCs to the
/// Raft thread via the transport bridge's input queue and awaits its reply.
#[derive(Debug)]
pub struct RaftGrpcServerImpl {
    raft_input_tx: mpsc::UnboundedSender<TransportMessage>,
    maybe_raft_thread_handle: Option<thread::JoinHandle<()>>,
}

impl RaftGrpcServerImpl {
    pub fn new(raft_input_tx: mpsc::UnboundedSender<TransportMessage>) -> RaftGrpcServerImpl {
        RaftGrpcServerImpl {
            raft_input_tx,
            maybe_raft_thread_handle: None,
        }
    }

    pub fn register_raft_thread(&mut self, raft_thread_handle: thread::JoinHandle<()>) {
        self.maybe_raft_thread_handle = Some(raft_thread_handle);
    }

    /// Sends an incoming request to the Raft thread's message queue for processing, then
    /// unparks the thread since it parks itself while waiting for the next message.
    pub fn send_incoming_request_to_transport(
        &self,
        reply_tx: oneshot::Sender<rpc_messages::ReplyTo>,
        incoming_request: rpc_messages::Request<MessagingCommand>,
    ) {
        self.raft_input_tx
            .send(TransportMessage::Request(reply_tx, incoming_request))
            .expect("Failed to send incoming request to gRPC transport!");
        self.maybe_raft_thread_handle
            .as_ref()
            .expect("Raft thread not registered!")
            .thread()
            .unpark();
    }
}

#[tonic::async_trait]
impl RaftConsensus for RaftGrpcServerImpl {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let vote_req = request.into_inner();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_incoming_request_to_transport(
            reply_tx,
            rpc_messages::Request::RequestVote(vote_req.into()),
        );

        match reply_rx.await {
            Ok(rpc_messages::ReplyTo::RequestVote(vote)) => Ok(Response::new(vote.into())),
            Err(_) => Err(Status::cancelled("Raft state machine shutdown!")),
            _ => unreachable!("BUG ALERT: Unexpected response type, expected RequestVote!"),
        }
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let append_entries_req = request.into_inner();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_incoming_request_to_transport(
            reply_tx,
            rpc_messages::Request::AppendEntries(append_entries_req.into()),
        );

        match reply_rx.await {
            Ok(rpc_messages::ReplyTo::AppendEntries(append_entries)) => {
                Ok(Response::new(append_entries.into()))
            }
            Err(_) => Err(Status::cancelled("Raft state machine shutdown!")),
            _ => unreachable!("BUG ALERT: Unexpected response type, expected AppendEntries!"),
        }
    }
}
