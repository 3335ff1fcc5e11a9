//! Generated gRPC/protobuf types for the Raft-internal and client-facing messaging RPCs.
//! `raftmail_transport` and `raftmail_server` convert between these wire types and the
//! `raft_consensus`/application-level Rust types; this crate is otherwise just generated code.

tonic::include_proto!("raftmail");
