use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teebox_dm::{
    DeleteMessageRequest, GetOrCreateChatRequest, MarkReadRequest, PageRequest,
    SendMessageRequest, DEFAULT_PAGE_SIZE,
};
use teebox_node::LocalApi;
use teebox_store::{DmStore, MessagingService, OpenDirectory, StoreConfig};
use teebox_sync::{ConversationState, FailedMessageQueue, SyncConfig, SyncDriver, SyncEngine};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Teebox node - direct messages over a local sharded store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SQLite database holding conversations and messages
    #[arg(short, long, default_value = "teebox-store.db")]
    db: PathBuf,

    /// User the commands run as
    #[arg(short, long)]
    user: String,

    /// Messages per shard. Fixed when the database is created; when omitted
    /// an existing database keeps its own.
    #[arg(long)]
    shard_size: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the user's conversations
    Chats,
    /// Find or create the direct chat with a peer
    Chat { peer: String },
    /// Create a group chat
    Group {
        #[arg(required = true)]
        members: Vec<String>,
    },
    /// Send a message
    Send {
        conversation: String,
        content: String,
        /// Client-chosen token that makes resending safe
        #[arg(long)]
        token: Option<String>,
    },
    /// Show one page of history, newest page first
    Page {
        conversation: String,
        #[arg(short, long, default_value_t = DEFAULT_PAGE_SIZE)]
        size: u64,
        /// Message id to page back from
        #[arg(short, long)]
        cursor: Option<String>,
    },
    /// Mark a conversation read
    Read { conversation: String },
    /// Unread totals across all conversations
    Unread,
    /// Delete one of the user's messages
    Delete {
        conversation: String,
        message: String,
    },
    /// Leave a group or archive a direct chat
    Leave { conversation: String },
    /// Apply metadata left behind by interrupted sends
    Reconcile,
    /// Chat with a peer through the client sync engine
    Demo {
        peer: String,
        /// Messages each side sends
        #[arg(short, long, default_value_t = 3)]
        messages: usize,
        /// SQLite file for messages that could not be sent
        #[arg(long, default_value = "teebox-failed.db")]
        failed_db: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    let store = DmStore::open(StoreConfig {
        db_path: args.db.clone(),
        shard_size: args.shard_size.unwrap_or(teebox_store::DEFAULT_SHARD_SIZE),
        adopt_recorded_layout: args.shard_size.is_none(),
        ..Default::default()
    })
    .await?;
    let service = store.service(Arc::new(OpenDirectory));
    let caller = Some(args.user.as_str());

    match args.command {
        Commands::Chats => print_json(&service.list_chats(caller).await?)?,
        Commands::Chat { peer } => print_json(
            &service
                .get_or_create_chat(caller, GetOrCreateChatRequest { peer_id: peer })
                .await?,
        )?,
        Commands::Group { members } => {
            print_json(&service.create_group(caller, members).await?)?
        }
        Commands::Send {
            conversation,
            content,
            token,
        } => print_json(
            &service
                .send_message(
                    caller,
                    SendMessageRequest {
                        conversation_id: conversation,
                        content,
                        idempotency_token: token,
                    },
                )
                .await?,
        )?,
        Commands::Page {
            conversation,
            size,
            cursor,
        } => print_json(
            &service
                .fetch_page(
                    caller,
                    PageRequest {
                        conversation_id: conversation,
                        page_size: size,
                        cursor_message_id: cursor,
                    },
                )
                .await?,
        )?,
        Commands::Read { conversation } => print_json(
            &service
                .mark_as_read(
                    caller,
                    MarkReadRequest {
                        conversation_id: conversation,
                    },
                )
                .await?,
        )?,
        Commands::Unread => print_json(&service.total_unread(caller).await?)?,
        Commands::Delete {
            conversation,
            message,
        } => print_json(
            &service
                .delete_message(
                    caller,
                    DeleteMessageRequest {
                        conversation_id: conversation,
                        message_id: message,
                    },
                )
                .await?,
        )?,
        Commands::Leave { conversation } => {
            service.leave_chat(caller, &conversation).await?;
            println!("Left {}", conversation);
        }
        Commands::Reconcile => {
            let report = store.reconciler().run_once().await?;
            println!(
                "Applied {} pending metadata rows, {} failed",
                report.applied, report.failed
            );
        }
        Commands::Demo {
            peer,
            messages,
            failed_db,
        } => run_demo(&store, service, &args.user, &peer, messages, failed_db).await?,
    }

    Ok(())
}

#[instrument(skip(store, service, failed_db))]
async fn run_demo(
    store: &DmStore,
    service: MessagingService,
    user: &str,
    peer: &str,
    messages: usize,
    failed_db: PathBuf,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let reconciler = store.start_reconciler(cancel.clone());

    let queue = FailedMessageQueue::open(&failed_db).await?;
    let config = SyncConfig {
        failed_queue_path: failed_db,
        ..Default::default()
    };
    let api = Arc::new(LocalApi::new(service.clone(), user));
    let engine = SyncEngine::new(api, user, config, queue);
    let (driver, handle) = SyncDriver::new(engine);
    let driver_task = driver.spawn();

    handle.open_chat(peer).await?;
    let view = tokio::time::timeout(
        Duration::from_secs(10),
        handle.wait_for(|v| v.state == ConversationState::Ready || v.last_error.is_some()),
    )
    .await
    .context("Timed out opening the chat")??;
    let Some(conversation_id) = view.conversation_id.clone() else {
        bail!(
            "Could not open chat with {}: {}",
            peer,
            view.last_error.unwrap_or_default()
        );
    };
    info!("Chatting in {} with {} loaded messages", conversation_id, view.messages.len());

    let before = view.messages.len();
    for i in 1..=messages {
        handle.send_message(format!("{} says hello #{}", user, i)).await?;
        service
            .send_message(
                Some(peer),
                SendMessageRequest {
                    conversation_id: conversation_id.clone(),
                    content: format!("{} replies #{}", peer, i),
                    idempotency_token: None,
                },
            )
            .await?;
    }

    let expected = before + 2 * messages;
    let view = tokio::time::timeout(
        Duration::from_secs(10),
        handle.wait_for(|v| !v.is_sending && v.messages.len() >= expected),
    )
    .await
    .context("Timed out waiting for messages")??;

    for message in &view.messages {
        println!("[{}] {}: {}", message.timestamp, message.sender_id, message.content);
    }

    handle.shutdown();
    driver_task.await?;
    cancel.cancel();
    reconciler.await?;
    Ok(())
}
