use clap::{Parser, Subcommand};
use raftmail_proto::messaging_client::MessagingClient;
use raftmail_proto::{
    CreateAccountRequest, DeleteAccountRequest, DeleteMessageRequest, DisplayConversationRequest,
    GetUnreadMessagesRequest, LeaderPingRequest, ListAccountsRequest, LoginRequest,
    MarkMessageAsReadRequest, ReadMessagesRequest, SendMessageRequest, SessionCredentials,
};
use tonic::transport::Channel;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Address of any node in the cluster; this client does not follow leader redirects.
    #[arg(short, long)]
    server_address: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new account.
    CreateAccount { username: String, credential: String },
    /// Log in and print a session token.
    Login { username: String, credential: String },
    /// List accounts, optionally filtered by a `*`/`?` wildcard pattern.
    ListAccounts {
        user_id: u32,
        token: String,
        #[arg(default_value = "")]
        pattern: String,
    },
    /// Show the full conversation with another user.
    DisplayConversation {
        user_id: u32,
        token: String,
        other_user_id: u32,
    },
    /// Send a message to another user.
    SendMessage {
        user_id: u32,
        token: String,
        receiver_id: u32,
        content: String,
    },
    /// Dequeue up to `max_messages` unread messages.
    ReadMessages {
        user_id: u32,
        token: String,
        max_messages: u32,
    },
    /// List unread message ids without dequeuing them.
    GetUnreadMessages { user_id: u32, token: String },
    /// Mark a single message as read.
    MarkMessageAsRead {
        user_id: u32,
        token: String,
        message_uid: u32,
    },
    /// Permanently delete a message.
    DeleteMessage {
        user_id: u32,
        token: String,
        message_uid: u32,
    },
    /// Delete the caller's account.
    DeleteAccount { user_id: u32, token: String },
    /// Ask a node whether it is the current leader.
    LeaderPing,
}

fn session(user_id: u32, token: String) -> SessionCredentials {
    SessionCredentials { user_id, token }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let channel = Channel::from_shared(format!("http://{}", cli.server_address))
        .expect("Failed to create channel")
        .connect()
        .await
        .expect("Failed to connect to server");

    let mut client = MessagingClient::new(channel.clone());

    info!("Connected to server: {:?}", cli.server_address);

    match cli.command {
        Commands::CreateAccount { username, credential } => {
            let result = client
                .create_account(tonic::Request::new(CreateAccountRequest {
                    username,
                    credential: credential.into_bytes(),
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::Login { username, credential } => {
            let result = client
                .login(tonic::Request::new(LoginRequest {
                    username,
                    credential: credential.into_bytes(),
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::ListAccounts { user_id, token, pattern } => {
            let result = client
                .list_accounts(tonic::Request::new(ListAccountsRequest {
                    session: Some(session(user_id, token)),
                    username_pattern: pattern,
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::DisplayConversation { user_id, token, other_user_id } => {
            let result = client
                .display_conversation(tonic::Request::new(DisplayConversationRequest {
                    session: Some(session(user_id, token)),
                    other_user_id,
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::SendMessage { user_id, token, receiver_id, content } => {
            let result = client
                .send_message(tonic::Request::new(SendMessageRequest {
                    session: Some(session(user_id, token)),
                    receiver_id,
                    content,
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::ReadMessages { user_id, token, max_messages } => {
            let result = client
                .read_messages(tonic::Request::new(ReadMessagesRequest {
                    session: Some(session(user_id, token)),
                    max_messages,
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::GetUnreadMessages { user_id, token } => {
            let result = client
                .get_unread_messages(tonic::Request::new(GetUnreadMessagesRequest {
                    session: Some(session(user_id, token)),
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::MarkMessageAsRead { user_id, token, message_uid } => {
            let result = client
                .mark_message_as_read(tonic::Request::new(MarkMessageAsReadRequest {
                    session: Some(session(user_id, token)),
                    message_uid,
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::DeleteMessage { user_id, token, message_uid } => {
            let result = client
                .delete_message(tonic::Request::new(DeleteMessageRequest {
                    session: Some(session(user_id, token)),
                    message_uid,
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::DeleteAccount { user_id, token } => {
            let result = client
                .delete_account(tonic::Request::new(DeleteAccountRequest {
                    session: Some(session(user_id, token)),
                }))
                .await?;
            info!("Result: {:?}", result);
        }
        Commands::LeaderPing => {
            let result = client
                .leader_ping(tonic::Request::new(LeaderPingRequest {}))
                .await?;
            info!("Result: {:?}", result);
        }
    }
    Ok(())
}
