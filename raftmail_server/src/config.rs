//! Loads the cluster configuration: a JSON object mapping node id strings to `"host:port"`
//! endpoints, identical at every node and at clients. Membership is static for the lifetime
//! of the cluster.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use raft_consensus::ServerId;

pub fn load_cluster_config(path: &Path) -> HashMap<ServerId, SocketAddr> {
    let raw = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("CONFIG: could not read cluster config {path:?}: {e}"));
    let parsed: HashMap<String, String> = serde_json::from_str(&raw)
        .unwrap_or_else(|e| panic!("CONFIG: could not parse cluster config {path:?}: {e}"));

    parsed
        .into_iter()
        .map(|(id, addr)| {
            let id: u64 = id
                .parse()
                .unwrap_or_else(|_| panic!("CONFIG: node id {id:?} is not a valid integer"));
            let addr: SocketAddr = addr
                .parse()
                .unwrap_or_else(|_| panic!("CONFIG: address {addr:?} is not a valid host:port"));
            (ServerId(id), addr)
        })
        .collect()
}
