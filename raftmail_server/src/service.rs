//! Service Façade: routes client RPCs, validates sessions, forwards mutations to the Raft
//! log and blocks the caller until they commit and apply, and serves reads directly from
//! `AppState`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use raft_consensus::{
    ClientCommandResult, ClientCommandSubmission, CommitStatus, LogIndex, RaftNodeState,
    ServerId, SharedRaftStatus,
};
use raftmail_proto::messaging_server::Messaging;
use raftmail_proto::{
    Account, ConversationMessage, CreateAccountRequest, CreateAccountResponse,
    DeleteAccountRequest, DeleteAccountResponse, DeleteMessageRequest, DeleteMessageResponse,
    DisplayConversationRequest, DisplayConversationResponse, GetMessageInformationRequest,
    GetMessageInformationResponse, GetUnreadMessagesRequest, GetUnreadMessagesResponse,
    GetUserByUsernameRequest, GetUserByUsernameResponse, GetUsernameByIdRequest,
    GetUsernameByIdResponse, LeaderPingRequest, LeaderPingResponse, ListAccountsRequest,
    ListAccountsResponse, LoginRequest, LoginResponse, MarkMessageAsReadRequest,
    MarkMessageAsReadResponse, ReadMessagesRequest, ReadMessagesResponse, SendMessageRequest,
    SendMessageResponse, SessionCredentials,
};
use raftmail_transport::MessagingCommand;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::app_state::Message as AppMessage;
use crate::command_applier::SharedAppState;
use crate::error::ServiceError;

pub struct MessagingServiceImpl {
    state: SharedAppState,
    /// `start_raft_in_new_thread` takes the receiving half of a plain `std::sync::mpsc`
    /// channel, not a tokio one; the sender is wrapped in a mutex purely so this struct stays
    /// `Sync` for tonic, not because sends ever contend.
    client_command_tx: Mutex<mpsc::Sender<ClientCommandSubmission<MessagingCommand>>>,
    commit_status: Arc<CommitStatus>,
    status: SharedRaftStatus,
    cluster: HashMap<ServerId, SocketAddr>,
    commit_wait_timeout: Duration,
    session_ttl: Duration,
}

impl MessagingServiceImpl {
    pub fn new(
        state: SharedAppState,
        client_command_tx: mpsc::Sender<ClientCommandSubmission<MessagingCommand>>,
        commit_status: Arc<CommitStatus>,
        status: SharedRaftStatus,
        cluster: HashMap<ServerId, SocketAddr>,
        commit_wait_timeout: Duration,
        session_ttl: Duration,
    ) -> Self {
        MessagingServiceImpl {
            state,
            client_command_tx: Mutex::new(client_command_tx),
            commit_status,
            status,
            cluster,
            commit_wait_timeout,
            session_ttl,
        }
    }

    fn leader_redirect_error(&self, leader_hint: Option<ServerId>) -> ServiceError {
        ServiceError::NotLeader {
            leader_addr: leader_hint.and_then(|id| self.cluster.get(&id)).map(|a| a.to_string()),
        }
    }

    /// Appends `command` to the Raft log via the client-command channel and blocks (off the
    /// async executor) until it has committed and been applied, or `commit_wait_timeout`
    /// elapses.
    async fn propose(&self, command: MessagingCommand) -> Result<LogIndex, ServiceError> {
        let (respond_to, response) = oneshot::channel();
        self.client_command_tx
            .lock()
            .expect("client command sender mutex poisoned")
            .send(ClientCommandSubmission { command, respond_to })
            .map_err(|_| ServiceError::Unavailable("raft thread shut down".into()))?;

        let result = tokio::task::spawn_blocking(move || response.recv())
            .await
            .map_err(|_| ServiceError::Unavailable("raft thread shut down".into()))?
            .map_err(|_| ServiceError::Unavailable("raft thread shut down".into()))?;

        let index = match result {
            ClientCommandResult::Accepted { index } => index,
            ClientCommandResult::NotLeader { leader_hint } => {
                return Err(self.leader_redirect_error(leader_hint))
            }
        };

        let commit_status = self.commit_status.clone();
        let timeout = self.commit_wait_timeout;
        let applied = tokio::task::spawn_blocking(move || {
            commit_status.wait_until_applied(index, timeout)
        })
        .await
        .unwrap_or(false);

        if applied {
            Ok(index)
        } else {
            Err(ServiceError::Unavailable(
                "timed out waiting for command to commit".into(),
            ))
        }
    }

    /// Returns `Ok(())` if this node currently believes itself to be the leader, else a
    /// not-leader/unavailable error carrying the leader hint.
    fn require_leader(&self) -> Result<(), ServiceError> {
        let snapshot = *self.status.lock().expect("raft status mutex poisoned");
        if snapshot.role == RaftNodeState::Leader {
            Ok(())
        } else {
            Err(self.leader_redirect_error(snapshot.leader_hint))
        }
    }

    fn validate_session(&self, session: Option<SessionCredentials>) -> Result<u32, ServiceError> {
        let session = session.ok_or(ServiceError::Unauthenticated)?;
        let token = decode_token(&session.token).ok_or(ServiceError::Unauthenticated)?;
        let state = self.state.lock().expect("application state mutex poisoned");
        if state.session_is_valid(session.user_id, &token, now_unix_secs()) {
            Ok(session.user_id)
        } else {
            Err(ServiceError::Unauthenticated)
        }
    }
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_secs() as i64
}

fn new_session_token() -> String {
    hex_encode(&Uuid::new_v4().as_bytes()[..])
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_token(hex: &str) -> Option<[u8; 16]> {
    if hex.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(out)
}

fn message_to_proto(message: &AppMessage) -> ConversationMessage {
    ConversationMessage {
        uid: message.uid,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        content: message.content.clone(),
        read: message.read,
        timestamp_unix_secs: message.timestamp_unix_secs,
    }
}

#[tonic::async_trait]
impl Messaging for MessagingServiceImpl {
    async fn create_account(
        &self,
        request: Request<CreateAccountRequest>,
    ) -> Result<Response<CreateAccountResponse>, Status> {
        self.require_leader().map_err(Status::from)?;
        let req = request.into_inner();

        let user_id = {
            let state = self.state.lock().expect("application state mutex poisoned");
            if state.username_exists(&req.username) {
                return Err(Status::from(ServiceError::AlreadyExists(format!(
                    "username {:?} already exists",
                    req.username
                ))));
            }
            state.peek_next_user_id()
        };

        self.propose(MessagingCommand::CreateAccount {
            user_id,
            username: req.username,
            credential: req.credential,
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(CreateAccountResponse { user_id }))
    }

    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        self.require_leader().map_err(Status::from)?;
        let req = request.into_inner();

        let user_id = {
            let state = self.state.lock().expect("application state mutex poisoned");
            let user = state
                .user_by_username(&req.username)
                .ok_or_else(|| ServiceError::NotFound(format!("no such user {:?}", req.username)))
                .map_err(Status::from)?;
            if user.credential != req.credential {
                return Err(Status::from(ServiceError::NotFound(
                    "username or credential incorrect".into(),
                )));
            }
            user.id
        };

        let token = new_session_token();
        let expires_at_unix_secs = now_unix_secs() + self.session_ttl.as_secs() as i64;

        self.propose(MessagingCommand::Login {
            user_id,
            token: token.clone(),
            expires_at_unix_secs,
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(LoginResponse {
            user_id,
            token,
            expires_at_unix_secs,
        }))
    }

    async fn list_accounts(
        &self,
        request: Request<ListAccountsRequest>,
    ) -> Result<Response<ListAccountsResponse>, Status> {
        let req = request.into_inner();
        self.validate_session(req.session).map_err(Status::from)?;

        let state = self.state.lock().expect("application state mutex poisoned");
        let accounts = state
            .accounts_matching(&req.username_pattern)
            .into_iter()
            .map(|(user_id, username)| Account { user_id, username })
            .collect();
        Ok(Response::new(ListAccountsResponse { accounts }))
    }

    async fn display_conversation(
        &self,
        request: Request<DisplayConversationRequest>,
    ) -> Result<Response<DisplayConversationResponse>, Status> {
        let req = request.into_inner();
        let user_id = self.validate_session(req.session).map_err(Status::from)?;

        let state = self.state.lock().expect("application state mutex poisoned");
        let messages = state
            .conversation(user_id, req.other_user_id)
            .into_iter()
            .map(message_to_proto)
            .collect();
        Ok(Response::new(DisplayConversationResponse { messages }))
    }

    async fn send_message(
        &self,
        request: Request<SendMessageRequest>,
    ) -> Result<Response<SendMessageResponse>, Status> {
        self.require_leader().map_err(Status::from)?;
        let req = request.into_inner();
        let sender_id = self.validate_session(req.session).map_err(Status::from)?;

        let message_id = {
            let state = self.state.lock().expect("application state mutex poisoned");
            state.peek_next_message_id()
        };

        self.propose(MessagingCommand::SendMessage {
            message_id,
            sender_id,
            receiver_id: req.receiver_id,
            content: req.content,
            timestamp_unix_secs: now_unix_secs(),
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(SendMessageResponse { message_uid: message_id }))
    }

    async fn read_messages(
        &self,
        request: Request<ReadMessagesRequest>,
    ) -> Result<Response<ReadMessagesResponse>, Status> {
        self.require_leader().map_err(Status::from)?;
        let req = request.into_inner();
        let user_id = self.validate_session(req.session).map_err(Status::from)?;

        let message_ids = {
            let state = self.state.lock().expect("application state mutex poisoned");
            state.peek_unread(user_id, req.max_messages)
        };

        if !message_ids.is_empty() {
            self.propose(MessagingCommand::ReadMessages {
                user_id,
                message_ids: message_ids.clone(),
            })
            .await
            .map_err(Status::from)?;
        }

        Ok(Response::new(ReadMessagesResponse { message_uids: message_ids }))
    }

    async fn delete_message(
        &self,
        request: Request<DeleteMessageRequest>,
    ) -> Result<Response<DeleteMessageResponse>, Status> {
        self.require_leader().map_err(Status::from)?;
        let req = request.into_inner();
        self.validate_session(req.session).map_err(Status::from)?;

        self.propose(MessagingCommand::DeleteMessage {
            message_id: req.message_uid,
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(DeleteMessageResponse {}))
    }

    async fn delete_account(
        &self,
        request: Request<DeleteAccountRequest>,
    ) -> Result<Response<DeleteAccountResponse>, Status> {
        self.require_leader().map_err(Status::from)?;
        let req = request.into_inner();
        let user_id = self.validate_session(req.session).map_err(Status::from)?;

        self.propose(MessagingCommand::DeleteAccount { user_id })
            .await
            .map_err(Status::from)?;

        Ok(Response::new(DeleteAccountResponse {}))
    }

    async fn get_unread_messages(
        &self,
        request: Request<GetUnreadMessagesRequest>,
    ) -> Result<Response<GetUnreadMessagesResponse>, Status> {
        let req = request.into_inner();
        let user_id = self.validate_session(req.session).map_err(Status::from)?;

        let state = self.state.lock().expect("application state mutex poisoned");
        Ok(Response::new(GetUnreadMessagesResponse {
            message_uids: state.unread_messages(user_id),
        }))
    }

    async fn get_message_information(
        &self,
        request: Request<GetMessageInformationRequest>,
    ) -> Result<Response<GetMessageInformationResponse>, Status> {
        let req = request.into_inner();
        self.validate_session(req.session).map_err(Status::from)?;

        let state = self.state.lock().expect("application state mutex poisoned");
        let message = state
            .message(req.message_uid)
            .ok_or_else(|| ServiceError::NotFound(format!("no message {}", req.message_uid)))
            .map_err(Status::from)?;
        Ok(Response::new(GetMessageInformationResponse {
            message: Some(message_to_proto(message)),
        }))
    }

    async fn get_username_by_id(
        &self,
        request: Request<GetUsernameByIdRequest>,
    ) -> Result<Response<GetUsernameByIdResponse>, Status> {
        let req = request.into_inner();
        self.validate_session(req.session).map_err(Status::from)?;

        let state = self.state.lock().expect("application state mutex poisoned");
        let user = state
            .user(req.target_user_id)
            .ok_or_else(|| ServiceError::NotFound(format!("no user {}", req.target_user_id)))
            .map_err(Status::from)?;
        Ok(Response::new(GetUsernameByIdResponse {
            username: user.username.clone(),
        }))
    }

    async fn mark_message_as_read(
        &self,
        request: Request<MarkMessageAsReadRequest>,
    ) -> Result<Response<MarkMessageAsReadResponse>, Status> {
        self.require_leader().map_err(Status::from)?;
        let req = request.into_inner();
        let user_id = self.validate_session(req.session).map_err(Status::from)?;

        self.propose(MessagingCommand::MarkRead {
            user_id,
            message_id: req.message_uid,
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(MarkMessageAsReadResponse {}))
    }

    async fn get_user_by_username(
        &self,
        request: Request<GetUserByUsernameRequest>,
    ) -> Result<Response<GetUserByUsernameResponse>, Status> {
        let req = request.into_inner();
        self.validate_session(req.session).map_err(Status::from)?;

        let state = self.state.lock().expect("application state mutex poisoned");
        let user = state
            .user_by_username(&req.username)
            .ok_or_else(|| ServiceError::NotFound(format!("no user {:?}", req.username)))
            .map_err(Status::from)?;
        Ok(Response::new(GetUserByUsernameResponse { user_id: user.id }))
    }

    async fn leader_ping(
        &self,
        _request: Request<LeaderPingRequest>,
    ) -> Result<Response<LeaderPingResponse>, Status> {
        let snapshot = *self.status.lock().expect("raft status mutex poisoned");
        let is_leader = snapshot.role == RaftNodeState::Leader;
        let leader_address = snapshot
            .leader_hint
            .and_then(|id| self.cluster.get(&id))
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        Ok(Response::new(LeaderPingResponse {
            is_leader,
            leader_address,
        }))
    }
}
