use futures_util::{SinkExt, StreamExt};
use rad_core::hub_protocol::{
    decode_server_msg, encode_client_msg, websocket_url, ClientMsg, EventPayload, ProtocolError,
    ServerMsg, DEFAULT_MAX_MESSAGE_BYTES,
};
use rad_core::HubEvent;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

const EVENT_QUEUE_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handlers = Arc<Mutex<HashMap<String, Arc<dyn EventHandler>>>>;

/// Receives every event of the topic it was subscribed to, in hub order, on
/// the client's single dispatcher task.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &HubEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    ShutDown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ShutDown => "shut_down",
        }
    }
}

#[derive(Clone, Default)]
pub struct Credentials {
    access_token: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub hub_base_url: String,
    pub credentials: Credentials,
    pub heartbeat_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub handshake_timeout: Duration,
    pub max_message_bytes: usize,
}

impl HubConfig {
    pub fn new(hub_base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            hub_base_url: hub_base_url.into(),
            credentials,
            heartbeat_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("topic '{0}' already has a handler")]
    AlreadySubscribed(String),
    #[error("hub client is shut down")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("hub rejected credentials: {0}")]
    AuthRejected(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection closed by hub")]
    Closed,
    #[error("no pong for ping {0} within one heartbeat")]
    HeartbeatTimeout(u64),
}

enum SessionEnd {
    Shutdown,
    Lost(SessionError),
}

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
}

struct Inner {
    handlers: Handlers,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Handle to the one long-lived hub connection. Clones share the connection.
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

impl HubClient {
    /// Spawns the connection task and the dispatcher. Must be called from
    /// within a tokio runtime. Only a malformed hub URL fails here; network
    /// trouble is retried in the background.
    pub fn connect(config: HubConfig) -> Result<Self, HubError> {
        let url = websocket_url(&config.hub_base_url)?;
        let handlers: Handlers = Arc::default();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(event = "hub_client_start", url = %url);
        let connection = Connection {
            config,
            url,
            handlers: handlers.clone(),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let connection_task = tokio::spawn(connection.run());
        let dispatch_task = tokio::spawn(dispatch_loop(handlers.clone(), event_rx));

        Ok(Self {
            inner: Arc::new(Inner {
                handlers,
                commands: command_tx,
                state: state_rx,
                shutdown: shutdown_tx,
                tasks: AsyncMutex::new(vec![connection_task, dispatch_task]),
            }),
        })
    }

    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<(), HubError> {
        if *self.inner.shutdown.borrow() {
            return Err(HubError::Closed);
        }
        {
            let mut handlers = lock_handlers(&self.inner.handlers);
            if handlers.contains_key(event_type) {
                return Err(HubError::AlreadySubscribed(event_type.to_string()));
            }
            handlers.insert(event_type.to_string(), handler);
        }
        if self
            .inner
            .commands
            .send(Command::Subscribe(event_type.to_string()))
            .is_err()
        {
            lock_handlers(&self.inner.handlers).remove(event_type);
            return Err(HubError::Closed);
        }
        debug!(event = "hub_subscribe", topic = %event_type);
        Ok(())
    }

    pub fn unsubscribe(&self, event_type: &str) -> bool {
        let removed = lock_handlers(&self.inner.handlers)
            .remove(event_type)
            .is_some();
        if removed {
            let _ = self
                .inner
                .commands
                .send(Command::Unsubscribe(event_type.to_string()));
            debug!(event = "hub_unsubscribe", topic = %event_type);
        }
        removed
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Stops both tasks and drops every handler. Safe to call repeatedly and
    /// from several clones; later calls wait for the first to finish.
    pub async fn shutdown(&self) {
        let already = self.inner.shutdown.send_replace(true);
        lock_handlers(&self.inner.handlers).clear();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(event = "hub_task_failed", error = %err);
                }
            }
        }
        if !already {
            info!(event = "hub_client_shutdown");
        }
    }

    pub fn ptr_eq(&self, other: &HubClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Process-scoped owner of the single `HubClient`. The client is created on
/// first use; `teardown` is the shutdown hook and may run whether or not a
/// client was ever created.
pub struct HubSlot {
    config: HubConfig,
    client: Mutex<Option<HubClient>>,
}

impl HubSlot {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<HubClient>> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_or_connect(&self) -> Result<HubClient, HubError> {
        let mut slot = self.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = HubClient::connect(self.config.clone())?;
        *slot = Some(client.clone());
        Ok(client)
    }

    pub fn current(&self) -> Option<HubClient> {
        self.lock().clone()
    }

    /// Returns whether a client existed.
    pub async fn teardown(&self) -> bool {
        let client = self.lock().take();
        match client {
            Some(client) => {
                client.shutdown().await;
                true
            }
            None => {
                debug!(event = "hub_teardown_without_client");
                false
            }
        }
    }
}

fn lock_handlers(
    handlers: &Handlers,
) -> MutexGuard<'_, HashMap<String, Arc<dyn EventHandler>>> {
    handlers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn registered_topics(handlers: &Handlers) -> Vec<String> {
    let mut topics: Vec<String> = lock_handlers(handlers).keys().cloned().collect();
    topics.sort();
    topics
}

async fn dispatch_loop(handlers: Handlers, mut events: mpsc::Receiver<HubEvent>) {
    while let Some(event) = events.recv().await {
        let handler = lock_handlers(&handlers).get(&event.event_type).cloned();
        match handler {
            Some(handler) => handler.on_event(&event),
            None => trace!(event = "hub_event_unhandled", event_type = %event.event_type),
        }
    }
}

/// Per-connection subscription ids. Ids start at 1 and reset with every new
/// connection. Also remembers the last ping the hub has not answered yet.
#[derive(Debug, Default)]
struct SubscriptionBook {
    last_id: u64,
    by_topic: HashMap<String, u64>,
    by_id: HashMap<u64, String>,
    awaiting_pong: Option<u64>,
}

impl SubscriptionBook {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn subscribe(&mut self, topic: &str) -> Option<ClientMsg> {
        if self.by_topic.contains_key(topic) {
            return None;
        }
        let id = self.next_id();
        self.by_topic.insert(topic.to_string(), id);
        self.by_id.insert(id, topic.to_string());
        Some(ClientMsg::SubscribeEvents {
            id,
            event_type: topic.to_string(),
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> Option<ClientMsg> {
        let subscription = self.by_topic.remove(topic)?;
        self.by_id.remove(&subscription);
        Some(ClientMsg::UnsubscribeEvents {
            id: self.next_id(),
            subscription,
        })
    }

    fn ping(&mut self) -> ClientMsg {
        let id = self.next_id();
        self.awaiting_pong = Some(id);
        ClientMsg::Ping { id }
    }

    fn unanswered_ping(&self) -> Option<u64> {
        self.awaiting_pong
    }

    fn len(&self) -> usize {
        self.by_topic.len()
    }

    /// Turns a server message into a deliverable event, if it is one.
    fn accept(&mut self, msg: ServerMsg) -> Option<HubEvent> {
        match msg {
            ServerMsg::Event(EventPayload { id, event }) => {
                let Some(topic) = self.by_id.get(&id) else {
                    trace!(event = "hub_event_unknown_subscription", id);
                    return None;
                };
                let mut event = HubEvent::from_payload(event);
                if event.event_type.is_empty() {
                    event.event_type = topic.clone();
                }
                Some(event)
            }
            ServerMsg::Result(result) if !result.success => {
                let (code, message) = result
                    .error
                    .map(|error| (error.code, error.message))
                    .unwrap_or_default();
                warn!(event = "hub_command_failed", id = result.id, code = %code, message = %message);
                None
            }
            ServerMsg::Pong { id } => {
                if self.awaiting_pong == Some(id) {
                    self.awaiting_pong = None;
                }
                None
            }
            ServerMsg::Result(_) => None,
            other => {
                debug!(event = "hub_message_ignored", message = ?other);
                None
            }
        }
    }
}

struct Connection {
    config: HubConfig,
    url: Url,
    handlers: Handlers,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<HubEvent>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self) {
        let mut backoff = self.config.initial_backoff;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);
            let established = tokio::select! {
                _ = shutdown_signal(&mut self.shutdown) => break,
                result = establish(&self.config, &self.url, &self.handlers) => result,
            };
            match established {
                Ok((ws, book)) => {
                    backoff = self.config.initial_backoff;
                    self.state.send_replace(ConnectionState::Connected);
                    info!(event = "hub_connected", url = %self.url, topics = book.len());
                    match self.run_session(ws, book).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(err) => warn!(event = "hub_connection_lost", error = %err),
                    }
                }
                Err(err) => {
                    warn!(
                        event = "hub_connect_error",
                        url = %self.url,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64
                    );
                }
            }
            self.state.send_replace(ConnectionState::Disconnected);
            tokio::select! {
                _ = shutdown_signal(&mut self.shutdown) => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.config.max_backoff);
        }
        self.state.send_replace(ConnectionState::ShutDown);
        debug!(event = "hub_connection_task_exit");
    }

    async fn run_session(&mut self, mut ws: WsStream, mut book: SubscriptionBook) -> SessionEnd {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_signal(&mut self.shutdown) => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                }
                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match decode_server_msg(&text, self.config.max_message_bytes) {
                            Ok(msg) => {
                                if let Some(event) = book.accept(msg) {
                                    if self.events.send(event).await.is_err() {
                                        return SessionEnd::Shutdown;
                                    }
                                }
                            }
                            Err(err) => warn!(event = "hub_decode_error", error = %err),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost(SessionError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Lost(err.into()),
                },
                Some(command) = self.commands.recv() => {
                    let msg = match command {
                        Command::Subscribe(topic) => book.subscribe(&topic),
                        Command::Unsubscribe(topic) => book.unsubscribe(&topic),
                    };
                    if let Some(msg) = msg {
                        if let Err(err) = send_msg(&mut ws, &msg).await {
                            return SessionEnd::Lost(err);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(id) = book.unanswered_ping() {
                        let _ = ws.close(None).await;
                        return SessionEnd::Lost(SessionError::HeartbeatTimeout(id));
                    }
                    let ping = book.ping();
                    if let Err(err) = send_msg(&mut ws, &ping).await {
                        return SessionEnd::Lost(err);
                    }
                    trace!(event = "hub_ping");
                }
            }
        }
    }
}

async fn establish(
    config: &HubConfig,
    url: &Url,
    handlers: &Handlers,
) -> Result<(WsStream, SubscriptionBook), SessionError> {
    tokio::time::timeout(config.handshake_timeout, handshake(config, url, handlers))
        .await
        .map_err(|_| SessionError::HandshakeTimeout)?
}

/// Authenticates and re-subscribes every registered topic on a fresh socket.
async fn handshake(
    config: &HubConfig,
    url: &Url,
    handlers: &Handlers,
) -> Result<(WsStream, SubscriptionBook), SessionError> {
    let (mut ws, _) = connect_async(url.as_str()).await?;
    loop {
        match next_server_msg(&mut ws, config.max_message_bytes).await? {
            ServerMsg::AuthRequired { .. } => {
                let auth = ClientMsg::Auth {
                    access_token: config.credentials.access_token().to_string(),
                };
                send_msg(&mut ws, &auth).await?;
            }
            ServerMsg::AuthOk { ha_version } => {
                debug!(event = "hub_auth_ok", version = ?ha_version);
                break;
            }
            ServerMsg::AuthInvalid { message } => {
                return Err(SessionError::AuthRejected(message.unwrap_or_default()));
            }
            other => debug!(event = "hub_handshake_skip", message = ?other),
        }
    }

    let mut book = SubscriptionBook::default();
    for topic in registered_topics(handlers) {
        if let Some(msg) = book.subscribe(&topic) {
            send_msg(&mut ws, &msg).await?;
        }
    }
    Ok((ws, book))
}

async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn next_server_msg(ws: &mut WsStream, max_message_bytes: usize) -> Result<ServerMsg, SessionError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(decode_server_msg(&text, max_message_bytes)?),
            Some(Ok(Message::Close(_))) | None => return Err(SessionError::Closed),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

async fn send_msg(ws: &mut WsStream, msg: &ClientMsg) -> Result<(), SessionError> {
    let text = encode_client_msg(msg)?;
    ws.send(Message::Text(text)).await?;
    Ok(())
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}
