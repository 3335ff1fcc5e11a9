//! gRPC transport binding the Raft core to the network: serves RequestVote/AppendEntries over
//! tonic, dials peers, and bridges the async gRPC runtime to the synchronous Raft thread.

pub mod command;
pub mod grpc_server;
pub mod grpc_transport;
pub mod proto_convert;

pub use command::MessagingCommand;
