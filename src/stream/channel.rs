//! Realtime websocket channel bound to one authenticated user.
//!
//! [`RealtimeChannel::connect`] performs the handshake on the caller's task
//! and then hands the socket to a background worker. The worker decodes
//! text frames into [`PushMessage`]s, dispatches them through the shared
//! [`SubscriptionRegistry`] and forwards queued outbound frames. The channel
//! never reconnects by itself; an unexpected drop is reported as
//! [`ChannelEvent::Disconnected`] and left to the owner.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::retry::with_timeout;
use crate::stream::proto::{encode_outbound, PushMessage};
use crate::stream::registry::SubscriptionRegistry;

const EVENT_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Out-of-band notifications about the connection itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    Connected {
        user_id: String,
    },
    /// `unexpected` is `false` only for [`RealtimeChannel::disconnect`].
    Disconnected {
        user_id: String,
        unexpected: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error("websocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),
}

enum Outbound {
    Frame(String),
    Close,
}

struct Link {
    state: ChannelState,
    user_id: Option<String>,
    /// Bumped by every connect and disconnect; a worker only reports back
    /// while its generation is current.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    worker: Option<JoinHandle<()>>,
}

enum Begin {
    AlreadyOpen,
    Replace,
    Start(u64),
}

struct Teardown {
    user_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    worker: Option<JoinHandle<()>>,
}

/// Cloneable handle; clones drive the same connection.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ClientConfig,
    registry: SubscriptionRegistry,
    events: broadcast::Sender<ChannelEvent>,
    link: Mutex<Link>,
}

impl RealtimeChannel {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_registry(config, SubscriptionRegistry::new())
    }

    pub fn with_registry(config: ClientConfig, registry: SubscriptionRegistry) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                registry,
                events,
                link: Mutex::new(Link {
                    state: ChannelState::Disconnected,
                    user_id: None,
                    generation: 0,
                    outbound: None,
                    worker: None,
                }),
            }),
        }
    }

    /// Registry that inbound messages are dispatched to.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock_link().state
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.lock_link().user_id.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Opens the channel for `user_id`.
    ///
    /// A no-op while already connecting or connected as the same user. A
    /// different user tears the current connection down first.
    pub async fn connect(&self, user_id: &str, token: &SecretString) -> Result<(), ChannelError> {
        let generation = loop {
            match self.inner.begin_connect(user_id) {
                Begin::AlreadyOpen => return Ok(()),
                Begin::Replace => self.disconnect().await,
                Begin::Start(generation) => break generation,
            }
        };

        info!(event = "realtime_connecting", user_id, generation);
        let socket = match self.open(user_id, token).await {
            Ok(socket) => socket,
            Err(err) => {
                self.inner.fail_connect(generation, &err);
                return Err(err);
            }
        };

        match Arc::clone(&self.inner).attach(generation, user_id, socket) {
            Ok(()) => {
                info!(event = "realtime_connected", user_id, generation);
                let _ = self.inner.events.send(ChannelEvent::Connected {
                    user_id: user_id.to_string(),
                });
                Ok(())
            }
            Err(mut socket) => {
                debug!(event = "realtime_connect_superseded", user_id, generation);
                let _ = socket.close(None).await;
                Err(ChannelError::Protocol(
                    "connection superseded before handshake completed".to_string(),
                ))
            }
        }
    }

    /// Closes the socket, stops the worker and drops every subscription.
    /// Safe to call in any state.
    pub async fn disconnect(&self) {
        let teardown = self.inner.begin_disconnect();
        self.inner.registry.clear();

        if let Some(outbound) = teardown.outbound {
            let _ = outbound.send(Outbound::Close);
        }
        if let Some(mut worker) = teardown.worker {
            if with_timeout(CLOSE_GRACE, &mut worker).await.is_err() {
                worker.abort();
            }
        }

        if let Some(user_id) = teardown.user_id {
            info!(event = "realtime_disconnected", user_id = %user_id);
            let _ = self.inner.events.send(ChannelEvent::Disconnected {
                user_id,
                unexpected: false,
            });
        }
    }

    /// Queues `{"type": message_type, ...payload}` for the server.
    ///
    /// Dropped silently unless the channel is connected.
    pub fn send(&self, message_type: &str, payload: Value) {
        let link = self.inner.lock_link();
        let outbound = match (&link.state, link.outbound.as_ref()) {
            (ChannelState::Connected, Some(outbound)) => outbound,
            _ => {
                debug!(event = "realtime_send_dropped", message_type, state = ?link.state);
                return;
            }
        };

        match frame(message_type, payload) {
            Ok(text) => {
                let _ = outbound.send(Outbound::Frame(text));
            }
            Err(err) => warn!(event = "realtime_send_encode_failed", message_type, error = %err),
        }
    }

    async fn open(&self, user_id: &str, token: &SecretString) -> Result<Socket, ChannelError> {
        let mut request = self.inner.config.ws_url(user_id).into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let timeout = self.inner.config.handshake_timeout;
        let (socket, _) = with_timeout(timeout, connect_async(request))
            .await
            .map_err(|_| ChannelError::HandshakeTimeout(timeout))??;
        Ok(socket)
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.inner.lock_link();
        f.debug_struct("RealtimeChannel")
            .field("state", &link.state)
            .field("user_id", &link.user_id)
            .field("generation", &link.generation)
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_connect(&self, user_id: &str) -> Begin {
        let mut link = self.lock_link();
        if link.state != ChannelState::Disconnected {
            if link.user_id.as_deref() == Some(user_id) {
                return Begin::AlreadyOpen;
            }
            return Begin::Replace;
        }

        link.generation += 1;
        link.state = ChannelState::Connecting;
        link.user_id = Some(user_id.to_string());
        Begin::Start(link.generation)
    }

    fn begin_disconnect(&self) -> Teardown {
        let mut link = self.lock_link();
        link.generation += 1;
        link.state = ChannelState::Disconnected;
        Teardown {
            user_id: link.user_id.take(),
            outbound: link.outbound.take(),
            worker: link.worker.take(),
        }
    }

    /// Installs the worker for `socket`, or hands the socket back when a
    /// newer connect or a disconnect has happened since `generation`.
    fn attach(self: Arc<Self>, generation: u64, user_id: &str, socket: Socket) -> Result<(), Socket> {
        let mut link = self.lock_link();
        if link.generation != generation {
            return Err(socket);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            Arc::downgrade(&self),
            generation,
            user_id.to_string(),
            socket,
            outbound_rx,
            self.registry.clone(),
            self.events.clone(),
        ));

        link.state = ChannelState::Connected;
        link.outbound = Some(outbound_tx);
        link.worker = Some(worker);
        Ok(())
    }

    fn fail_connect(&self, generation: u64, err: &ChannelError) {
        let user_id = {
            let mut link = self.lock_link();
            if link.generation != generation {
                return;
            }
            link.state = ChannelState::Disconnected;
            link.user_id.take()
        };

        warn!(event = "realtime_connect_failed", generation, error = %err);
        self.report_drop(user_id, err.to_string());
    }

    /// Called by a worker whose socket ended without a local disconnect.
    fn worker_stopped(&self, generation: u64, reason: String) {
        let user_id = {
            let mut link = self.lock_link();
            if link.generation != generation {
                return;
            }
            link.state = ChannelState::Disconnected;
            link.outbound = None;
            link.worker = None;
            link.user_id.take()
        };

        warn!(event = "realtime_connection_lost", generation, reason = %reason);
        self.report_drop(user_id, reason);
    }

    fn report_drop(&self, user_id: Option<String>, message: String) {
        let _ = self.events.send(ChannelEvent::Error { message });
        if let Some(user_id) = user_id {
            let _ = self.events.send(ChannelEvent::Disconnected {
                user_id,
                unexpected: true,
            });
        }
    }
}

enum WorkerExit {
    Closed,
    Lost(String),
}

async fn run_worker(
    channel: Weak<ChannelInner>,
    generation: u64,
    user_id: String,
    mut socket: Socket,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    registry: SubscriptionRegistry,
    events: broadcast::Sender<ChannelEvent>,
) {
    let exit = loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(Outbound::Frame(text)) => {
                        if let Err(err) = socket.send(Message::Text(text.into())).await {
                            break WorkerExit::Lost(format!("send failed: {err}"));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = socket.close(None).await;
                        break WorkerExit::Closed;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => deliver(&registry, &events, text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            break WorkerExit::Lost(format!("pong failed: {err}"));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| {
                                format!(
                                    "closed by server: {} {}",
                                    u16::from(frame.code),
                                    frame.reason.as_str()
                                )
                            })
                            .unwrap_or_else(|| "closed by server".to_string());
                        break WorkerExit::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break WorkerExit::Lost(err.to_string()),
                    None => break WorkerExit::Lost("socket ended".to_string()),
                }
            }
        }
    };

    match exit {
        WorkerExit::Closed => debug!(event = "realtime_worker_closed", user_id = %user_id, generation),
        WorkerExit::Lost(reason) => {
            if let Some(channel) = channel.upgrade() {
                channel.worker_stopped(generation, reason);
            }
        }
    }
}

fn deliver(registry: &SubscriptionRegistry, events: &broadcast::Sender<ChannelEvent>, text: &str) {
    match PushMessage::from_text(text) {
        Ok(message) if message.kind().is_none() => {
            debug!(event = "realtime_unknown_message", message_type = message.type_tag());
        }
        Ok(message) => {
            let handlers = registry.dispatch(&message);
            debug!(event = "realtime_message", message_type = message.type_tag(), handlers);
        }
        Err(err) => {
            warn!(event = "realtime_frame_rejected", error = %err);
            let _ = events.send(ChannelEvent::Error {
                message: format!("undecodable frame: {err}"),
            });
        }
    }
}

fn frame(message_type: &str, payload: Value) -> Result<String, ChannelError> {
    Ok(encode_outbound(message_type, payload)?)
}
