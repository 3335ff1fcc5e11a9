//! Error kinds the Service Façade can return, each mapped to a distinct gRPC status.

use tonic::Status;

#[derive(Debug, Clone)]
pub enum ServiceError {
    /// Invalid or expired session token.
    Unauthenticated,
    /// Not the leader; carries the leader's endpoint when known.
    NotLeader { leader_addr: Option<String> },
    /// No leader known, a peer is unreachable, or the commit-wait timed out.
    Unavailable(String),
    /// Username collision on create-account.
    AlreadyExists(String),
    /// User or message absent for a lookup RPC.
    NotFound(String),
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unauthenticated => {
                Status::unauthenticated("invalid or expired session token")
            }
            ServiceError::NotLeader {
                leader_addr: Some(addr),
            } => Status::failed_precondition(format!("Not the leader. Try {addr}")),
            ServiceError::NotLeader { leader_addr: None } => {
                Status::unavailable("no leader known")
            }
            ServiceError::Unavailable(detail) => Status::unavailable(detail),
            ServiceError::AlreadyExists(detail) => Status::already_exists(detail),
            ServiceError::NotFound(detail) => Status::not_found(detail),
        }
    }
}
