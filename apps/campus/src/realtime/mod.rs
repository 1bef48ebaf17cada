//! The persistent realtime channel and its topic subscriptions.
//!
//! One websocket per client instance. `connect` is idempotent; subscriptions
//! are gated on the connected signal and each [`TopicSubscription`]
//! unsubscribes the exact topic it subscribed to, never "whatever the
//! current topic is now". Incoming events are de-duplicated by entity id
//! against locally-originated inserts before handlers run.

pub mod protocol;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::{Duration, interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use url::Url;
use uuid::Uuid;

use protocol::{ClientFrame, PushEvent, ServerFrame};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("realtime connection failed: {0}")]
    Connect(String),
    #[error("realtime channel is not connected")]
    NotConnected,
    #[error("realtime channel closed")]
    ChannelClosed,
}

type EventHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<(Uuid, EventHandler)>>>,
}

impl HandlerRegistry {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, event_type: &str, handler: EventHandler) -> Uuid {
        let id = Uuid::new_v4();
        self.handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&self, event_type: &str, id: Uuid) {
        let mut handlers = self.handlers.write();
        if let Some(entries) = handlers.get_mut(event_type) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                handlers.remove(event_type);
            }
        }
    }

    fn dispatch(&self, event: &PushEvent) {
        let handlers = self.handlers.read();
        if let Some(entries) = handlers.get(&event.event_type) {
            for (_, handler) in entries {
                handler(event);
            }
        }
    }
}

/// Unregister handle returned by [`RealtimeClient::on_message`].
pub struct HandlerRegistration {
    registry: Arc<HandlerRegistry>,
    event_type: String,
    id: Uuid,
}

impl HandlerRegistration {
    pub fn unregister(self) {
        self.registry.remove(&self.event_type, self.id);
    }
}

/// A live topic subscription. Dropping it (or calling `unsubscribe`)
/// deregisters exactly the topic it was created for.
#[derive(Debug)]
pub struct TopicSubscription {
    topic_id: String,
    topics: Arc<SyncMutex<HashSet<String>>>,
    frame_tx: mpsc::UnboundedSender<ClientFrame>,
    released: bool,
}

impl TopicSubscription {
    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.topics.lock().remove(&self.topic_id);
        // Best effort: if the channel is already gone there is nothing to
        // tell the server.
        let _ = self.frame_tx.send(ClientFrame::Unsubscribe {
            topic_id: self.topic_id.clone(),
        });
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

struct Connection {
    frame_tx: mpsc::UnboundedSender<ClientFrame>,
    writer: tokio::task::JoinHandle<()>,
    reader: tokio::task::JoinHandle<()>,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl Connection {
    fn shutdown(&self) {
        self.writer.abort();
        self.reader.abort();
        self.heartbeat.abort();
    }
}

/// Client side of the realtime channel. Explicitly constructed and shared by
/// the pages that need live updates; the subscription set is only mutated by
/// each page's own mount/unmount lifecycle.
pub struct RealtimeClient {
    url: Url,
    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,
    connection: AsyncMutex<Option<Connection>>,
    registry: Arc<HandlerRegistry>,
    local_origin: Arc<SyncMutex<HashSet<String>>>,
    topics: Arc<SyncMutex<HashSet<String>>>,
}

impl RealtimeClient {
    pub fn new(url: Url) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        Self {
            url,
            state_tx,
            state_rx,
            connection: AsyncMutex::new(None),
            registry: Arc::new(HandlerRegistry::new()),
            local_origin: Arc::new(SyncMutex::new(HashSet::new())),
            topics: Arc::new(SyncMutex::new(HashSet::new())),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Observable connection state, for callers that await the connected
    /// signal before subscribing.
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    pub async fn await_connected(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow() == ChannelState::Connected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Establish the channel. Idempotent: a second call while connecting or
    /// connected does nothing.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let mut connection = self.connection.lock().await;
        if self.state() != ChannelState::Disconnected && connection.is_some() {
            return Ok(());
        }
        if let Some(stale) = connection.take() {
            stale.shutdown();
        }
        *connection = Some(self.open_channel().await?);
        Ok(())
    }

    /// Re-establish a dropped channel and re-subscribe the topics currently
    /// held — exactly those, not any stale ones.
    pub async fn ensure_connected(&self) -> Result<(), RealtimeError> {
        let mut connection = self.connection.lock().await;
        if self.state() == ChannelState::Connected && connection.is_some() {
            return Ok(());
        }
        if let Some(old) = connection.take() {
            old.shutdown();
        }
        let fresh = self.open_channel().await?;
        let current: Vec<String> = self.topics.lock().iter().cloned().collect();
        for topic_id in current {
            tracing::debug!(target: "campus::realtime", topic = %topic_id, "re-subscribing after reconnect");
            fresh
                .frame_tx
                .send(ClientFrame::Subscribe { topic_id })
                .map_err(|_| RealtimeError::ChannelClosed)?;
        }
        *connection = Some(fresh);
        Ok(())
    }

    async fn open_channel(&self) -> Result<Connection, RealtimeError> {
        let _ = self.state_tx.send(ChannelState::Connecting);
        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|err| {
            let _ = self.state_tx.send(ChannelState::Disconnected);
            RealtimeError::Connect(err.to_string())
        })?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();

        // Forward outgoing frames to the socket.
        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let Ok(json) = serde_json::to_string(&frame) else {
                    continue;
                };
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        // Deliver incoming frames to handlers; flip the state on close.
        let registry = self.registry.clone();
        let local_origin = self.local_origin.clone();
        let state_tx = self.state_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => deliver(&registry, &local_origin, frame),
                            Err(err) => {
                                tracing::trace!(target: "campus::realtime", %err, "ignoring unparseable frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            let _ = state_tx.send(ChannelState::Disconnected);
        });

        // Keepalive pings.
        let heartbeat_tx = frame_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientFrame::Ping).is_err() {
                    break;
                }
            }
        });

        let _ = self.state_tx.send(ChannelState::Connected);
        tracing::debug!(target: "campus::realtime", url = %self.url, "realtime channel connected");
        Ok(Connection {
            frame_tx,
            writer,
            reader,
            heartbeat,
        })
    }

    /// Register interest in a topic. The channel must report connected
    /// first; await [`await_connected`](Self::await_connected) before
    /// calling from an asynchronous mount path.
    pub async fn subscribe(&self, topic_id: &str) -> Result<TopicSubscription, RealtimeError> {
        let connection = self.connection.lock().await;
        if self.state() != ChannelState::Connected {
            return Err(RealtimeError::NotConnected);
        }
        let Some(connection) = connection.as_ref() else {
            return Err(RealtimeError::NotConnected);
        };
        connection
            .frame_tx
            .send(ClientFrame::Subscribe {
                topic_id: topic_id.to_string(),
            })
            .map_err(|_| RealtimeError::ChannelClosed)?;
        self.topics.lock().insert(topic_id.to_string());
        Ok(TopicSubscription {
            topic_id: topic_id.to_string(),
            topics: self.topics.clone(),
            frame_tx: connection.frame_tx.clone(),
            released: false,
        })
    }

    /// Deregister interest in a topic by id. Pages that hold a
    /// [`TopicSubscription`] normally let the guard do this; the explicit
    /// form exists for callers that manage topic ids directly.
    pub async fn unsubscribe(&self, topic_id: &str) {
        self.topics.lock().remove(topic_id);
        let connection = self.connection.lock().await;
        if let Some(connection) = connection.as_ref() {
            let _ = connection.frame_tx.send(ClientFrame::Unsubscribe {
                topic_id: topic_id.to_string(),
            });
        }
    }

    /// Register a typed handler; the returned registration unregisters it.
    pub fn on_message<F>(&self, event_type: &str, handler: F) -> HandlerRegistration
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let id = self.registry.insert(event_type, Arc::new(handler));
        HandlerRegistration {
            registry: self.registry.clone(),
            event_type: event_type.to_string(),
            id,
        }
    }

    /// Record an entity id this client just inserted optimistically, so the
    /// echo of its own write is not delivered as a duplicate.
    pub fn note_local(&self, entity_id: &str) {
        self.local_origin.lock().insert(entity_id.to_string());
    }

    /// Tear the channel down.
    pub async fn close(&self) {
        let mut connection = self.connection.lock().await;
        if let Some(connection) = connection.take() {
            connection.shutdown();
        }
        let _ = self.state_tx.send(ChannelState::Disconnected);
    }
}

/// Route one server frame: suppress echoes of local inserts, hand events to
/// the registry, log the rest.
fn deliver(
    registry: &HandlerRegistry,
    local_origin: &SyncMutex<HashSet<String>>,
    frame: ServerFrame,
) {
    match frame {
        ServerFrame::Event { event } => {
            if let Some(entity_id) = event.entity_id() {
                // One-shot suppression: only the echo of the optimistic
                // insert is dropped, later events for the entity flow.
                if local_origin.lock().remove(entity_id) {
                    tracing::trace!(target: "campus::realtime", entity_id, "suppressed local echo");
                    return;
                }
            }
            registry.dispatch(&event);
        }
        ServerFrame::Subscribed { topic_id } => {
            tracing::debug!(target: "campus::realtime", topic = %topic_id, "subscription confirmed");
        }
        ServerFrame::Unsubscribed { topic_id } => {
            tracing::debug!(target: "campus::realtime", topic = %topic_id, "unsubscribed");
        }
        ServerFrame::Error { message } => {
            tracing::warn!(target: "campus::realtime", %message, "realtime server error");
        }
        ServerFrame::Pong => {}
    }
}
