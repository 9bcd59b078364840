//! Runs a [`SyncEngine`] as one task
//!
//! The UI talks to the task through a [`SyncHandle`]: commands go in over a
//! channel, the rendered state comes back as a watched [`ViewSnapshot`], and
//! connectivity is reported through a watched flag. Sends are delivered
//! concurrently while the engine keeps handling other events.

use crate::engine::{OutgoingSend, SyncEngine, ViewSnapshot};
use crate::error::{SyncError, SyncResult};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use teebox_dm::{ApiError, LiveUpdate, SendMessageResponse};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;

type Delivery = BoxFuture<'static, (OutgoingSend, Result<SendMessageResponse, ApiError>)>;

#[derive(Debug, Clone)]
pub enum Command {
    RefreshChats,
    OpenChat { peer_id: String },
    Activate { conversation_id: String },
    LoadOlder,
    Send { content: String },
    Delete { message_id: String },
    Shutdown,
}

#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ViewSnapshot>,
    network: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

impl SyncHandle {
    pub async fn command(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Stopped)
    }

    pub async fn send_message(&self, content: impl Into<String>) -> SyncResult<()> {
        self.command(Command::Send {
            content: content.into(),
        })
        .await
    }

    pub async fn open_chat(&self, peer_id: impl Into<String>) -> SyncResult<()> {
        self.command(Command::OpenChat {
            peer_id: peer_id.into(),
        })
        .await
    }

    /// Report connectivity as seen by the platform
    pub fn set_online(&self, online: bool) {
        self.network.send_replace(online);
    }

    /// The latest published view
    pub fn view(&self) -> ViewSnapshot {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ViewSnapshot> {
        self.view.clone()
    }

    /// Wait until a published view satisfies `predicate`
    pub async fn wait_for<P>(&self, mut predicate: P) -> SyncResult<ViewSnapshot>
    where
        P: FnMut(&ViewSnapshot) -> bool,
    {
        let mut view = self.view.clone();
        loop {
            {
                let current = view.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            view.changed().await.map_err(|_| SyncError::Stopped)?;
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct SyncDriver {
    engine: SyncEngine,
    commands: mpsc::Receiver<Command>,
    view: watch::Sender<ViewSnapshot>,
    network: watch::Receiver<bool>,
    cancel: CancellationToken,
    live: Option<broadcast::Receiver<LiveUpdate>>,
    deliveries: FuturesUnordered<Delivery>,
}

impl SyncDriver {
    pub fn new(engine: SyncEngine) -> (Self, SyncHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view_rx) = watch::channel(engine.snapshot(Instant::now()));
        let (network_tx, network_rx) = watch::channel(engine.is_online());
        let cancel = CancellationToken::new();

        let driver = Self {
            engine,
            commands: command_rx,
            view: view_tx,
            network: network_rx,
            cancel: cancel.clone(),
            live: None,
            deliveries: FuturesUnordered::new(),
        };
        let handle = SyncHandle {
            commands: command_tx,
            view: view_rx,
            network: Arc::new(network_tx),
            cancel,
        };
        (driver, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.engine.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut network_open = true;

        info!("Sync driver started for {}", self.engine.user_id());
        if let Err(e) = self.engine.refresh_chats(false).await {
            self.engine.note_error(&e);
        }
        self.publish();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                update = next_update(&mut self.live) => self.on_live(update),
                changed = self.network.changed(), if network_open => match changed {
                    Ok(()) => {
                        let online = *self.network.borrow_and_update();
                        self.on_network(online).await;
                    }
                    Err(_) => network_open = false,
                },
                Some((send, result)) = self.deliveries.next(), if !self.deliveries.is_empty() => {
                    if let Err(e) = self.engine.complete_send(send, result).await {
                        self.engine.note_error(&e);
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.flush_read_receipts(Instant::now()).await {
                        self.engine.note_error(&e);
                    }
                },
            }
            self.publish();
        }

        // Settle sends already on the wire so failures reach the queue
        while let Some((send, result)) = self.deliveries.next().await {
            if let Err(e) = self.engine.complete_send(send, result).await {
                self.engine.note_error(&e);
            }
        }
        self.engine.close();
        self.publish();
        info!("Sync driver stopped for {}", self.engine.user_id());
    }

    async fn handle(&mut self, command: Command) {
        debug!("Handling {:?}", command);
        let result = match command {
            Command::RefreshChats => self.engine.refresh_chats(true).await.map(|_| ()),
            Command::OpenChat { peer_id } => match self.engine.open_chat_with(&peer_id).await {
                Ok(_) => {
                    self.resubscribe().await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Command::Activate { conversation_id } => {
                match self.engine.activate(&conversation_id).await {
                    Ok(()) => {
                        self.resubscribe().await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Command::LoadOlder => self.engine.load_older().await.map(|_| ()),
            Command::Send { content } => match self.engine.begin_send(&content) {
                Ok(send) => {
                    let delivery =
                        SyncEngine::deliver(self.engine.api(), self.engine.config().retry.clone(), send);
                    self.deliveries.push(delivery.boxed());
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Command::Delete { message_id } => self.engine.delete_message(&message_id).await,
            Command::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            self.engine.note_error(&e);
        }
    }

    fn on_live(&mut self, update: Result<LiveUpdate, RecvError>) {
        match update {
            Ok(update) => self.engine.apply_live_update(update, Instant::now()),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Live feed lagged, skipped {} updates", skipped);
            }
            Err(RecvError::Closed) => {
                info!("Live feed closed");
                self.live = None;
            }
        }
    }

    async fn on_network(&mut self, online: bool) {
        let was_online = self.engine.is_online();
        match self.engine.on_network_change(online).await {
            Ok(Some(report)) => debug!("Reconnected: {:?}", report),
            Ok(None) => {}
            Err(e) => self.engine.note_error(&e),
        }

        if !online {
            self.live = None;
        } else if !was_online {
            self.resubscribe().await;
        }
    }

    async fn resubscribe(&mut self) {
        let Some(conversation_id) = self.engine.active_conversation_id().map(str::to_string) else {
            self.live = None;
            return;
        };

        match self.engine.api().subscribe(&conversation_id).await {
            Ok(receiver) => {
                debug!("Subscribed to live updates of {}", conversation_id);
                self.live = Some(receiver);
            }
            Err(e) => {
                warn!("Live subscription to {} failed: {}", conversation_id, e);
                self.live = None;
            }
        }
    }

    fn publish(&self) {
        self.view.send_replace(self.engine.snapshot(Instant::now()));
    }
}

async fn next_update(
    live: &mut Option<broadcast::Receiver<LiveUpdate>>,
) -> Result<LiveUpdate, RecvError> {
    match live {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
