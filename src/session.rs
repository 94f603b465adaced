//! Session lifecycle: login, logout and irrecoverable auth failure.
//!
//! [`SessionController`] owns the request pipeline and the realtime channel
//! for one signed-in user and keeps them consistent. Two background tasks run
//! for its lifetime:
//!
//! - an auth watcher that ends the session when the pipeline reports
//!   [`AuthSignal::RefreshRejected`];
//! - a reconnect supervisor that re-opens the channel after an unexpected drop
//!   while the same user is still signed in, following
//!   [`ClientConfig::reconnect_policy`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::error::ApiError;
use crate::api::pipeline::{AuthSignal, RequestPipeline};
use crate::api::services::TradingApi;
use crate::api::types::{LoginRequest, User};
use crate::config::ClientConfig;
use crate::credentials::{load_token_pair, CredentialStore, CredentialStoreError, TokenPair};
use crate::retry::{retry_async, RetryPolicy};
use crate::stream::channel::{ChannelError, ChannelEvent, ChannelState, RealtimeChannel};

const SESSION_EVENT_CAPACITY: usize = 16;

/// Snapshot of who is signed in.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Session {
    pub user_id: Option<String>,
    pub authenticated: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogoutReason {
    UserRequested,
    /// Token refresh was rejected; the user has to sign in again.
    AuthExpired,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    LoggedIn { user_id: String },
    LoggedOut { reason: LogoutReason },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("credential store error: {0}")]
    Store(#[from] CredentialStoreError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Session-scoped context. Clones share the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: Arc<dyn CredentialStore>,
    pipeline: RequestPipeline,
    api: TradingApi,
    channel: RealtimeChannel,
    state: Mutex<Session>,
    events: broadcast::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum ReconnectError {
    SessionEnded,
    Channel(ChannelError),
}

impl SessionController {
    /// Builds the pipeline and channel and starts the background tasks.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self, SessionError> {
        let pipeline = RequestPipeline::new(config.clone(), Arc::clone(&store))?;
        let channel = RealtimeChannel::new(config.clone());
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        let auth_signals = pipeline.subscribe_auth_signals();
        let channel_events = channel.events();

        let inner = Arc::new(SessionInner {
            store,
            api: TradingApi::new(pipeline.clone()),
            pipeline,
            channel,
            state: Mutex::new(Session::default()),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let watcher = tokio::spawn(watch_auth(Arc::downgrade(&inner), auth_signals));
        let supervisor = tokio::spawn(supervise_reconnects(
            Arc::downgrade(&inner),
            channel_events,
            config.reconnect_policy,
        ));
        inner.lock_tasks().extend([watcher, supervisor]);

        Ok(Self { inner })
    }

    pub fn session(&self) -> Session {
        self.inner.lock_state().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.lock_state().authenticated
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn api(&self) -> TradingApi {
        self.inner.api.clone()
    }

    pub fn pipeline(&self) -> RequestPipeline {
        self.inner.pipeline.clone()
    }

    pub fn channel(&self) -> RealtimeChannel {
        self.inner.channel.clone()
    }

    /// Signs in through `POST /auth/login` and starts the session.
    pub async fn login(&self, request: &LoginRequest) -> Result<User, SessionError> {
        let response = self.inner.api.login(request).await?;
        let tokens = TokenPair::new(response.access_token, response.refresh_token);
        self.on_login_success(&response.user.id, tokens).await?;
        Ok(response.user)
    }

    /// Stores `tokens`, marks the session authenticated and opens the
    /// channel. A failed handshake does not fail the login; the reconnect
    /// supervisor retries it.
    pub async fn on_login_success(&self, user_id: &str, tokens: TokenPair) -> Result<(), SessionError> {
        self.inner.pipeline.install_tokens(&tokens)?;
        self.inner.enter(user_id);

        if let Err(err) = self.inner.channel.connect(user_id, &tokens.access).await {
            warn!(event = "session_channel_connect_failed", user_id, error = %err);
        }
        Ok(())
    }

    /// Restores a session from persisted tokens, e.g. after a restart.
    ///
    /// Returns `Ok(None)` when nothing is stored.
    pub async fn resume(&self) -> Result<Option<User>, SessionError> {
        if load_token_pair(self.inner.store.as_ref()).is_none() {
            debug!(event = "session_resume_skipped");
            return Ok(None);
        }

        let user = self.inner.api.current_user().await?;
        self.inner.enter(&user.id);

        match self.inner.pipeline.access_token() {
            Some(token) => {
                if let Err(err) = self.inner.channel.connect(&user.id, &token).await {
                    warn!(event = "session_channel_connect_failed", user_id = %user.id, error = %err);
                }
            }
            None => warn!(event = "session_resume_without_access_token", user_id = %user.id),
        }
        Ok(Some(user))
    }

    pub async fn on_logout(&self) {
        self.inner.end(LogoutReason::UserRequested).await;
    }

    pub async fn on_auth_irrecoverable(&self) {
        self.inner.end(LogoutReason::AuthExpired).await;
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("session", &self.session())
            .field("channel", &self.inner.channel)
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, Session> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_authenticated_as(&self, user_id: &str) -> bool {
        let state = self.lock_state();
        state.authenticated && state.user_id.as_deref() == Some(user_id)
    }

    fn enter(&self, user_id: &str) {
        *self.lock_state() = Session {
            user_id: Some(user_id.to_string()),
            authenticated: true,
        };
        info!(event = "session_logged_in", user_id);
        let _ = self.events.send(SessionEvent::LoggedIn {
            user_id: user_id.to_string(),
        });
    }

    /// State first, so the reconnect supervisor stands down, then channel,
    /// then tokens. `LoggedOut` is only broadcast when a signed-in session
    /// actually ended.
    async fn end(&self, reason: LogoutReason) {
        let previous = std::mem::take(&mut *self.lock_state());
        self.channel.disconnect().await;
        if let Err(err) = self.pipeline.clear_tokens() {
            warn!(event = "session_clear_tokens_failed", error = %err);
        }

        if !previous.authenticated {
            debug!(event = "session_logout_ignored", reason = ?reason);
            return;
        }

        info!(event = "session_logged_out", user_id = ?previous.user_id, reason = ?reason);
        let _ = self.events.send(SessionEvent::LoggedOut { reason });
    }

    /// Returns `true` when the channel is open again for `user_id`.
    async fn reconnect(&self, user_id: &str, policy: &RetryPolicy) -> bool {
        let result = retry_async(
            policy,
            move |attempt| async move {
                if !self.is_authenticated_as(user_id) {
                    return Err(ReconnectError::SessionEnded);
                }
                let token = self
                    .pipeline
                    .access_token()
                    .ok_or(ReconnectError::SessionEnded)?;
                debug!(event = "session_reconnect_attempt", user_id, attempt);
                self.channel
                    .connect(user_id, &token)
                    .await
                    .map_err(ReconnectError::Channel)
            },
            |err| matches!(err, ReconnectError::Channel(_)),
        )
        .await;

        match result {
            Ok(()) if self.is_authenticated_as(user_id) => {
                info!(event = "session_reconnected", user_id);
                true
            }
            Ok(()) => {
                self.channel.disconnect().await;
                false
            }
            Err(ReconnectError::SessionEnded) => {
                debug!(event = "session_reconnect_abandoned", user_id);
                false
            }
            Err(ReconnectError::Channel(err)) => {
                warn!(event = "session_reconnect_exhausted", user_id, error = %err);
                false
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

async fn watch_auth(session: Weak<SessionInner>, mut signals: broadcast::Receiver<AuthSignal>) {
    loop {
        match signals.recv().await {
            Ok(AuthSignal::RefreshRejected) => {
                let Some(inner) = session.upgrade() else {
                    return;
                };
                warn!(event = "session_auth_expired");
                inner.end(LogoutReason::AuthExpired).await;
            }
            Err(RecvError::Lagged(skipped)) => debug!(event = "session_auth_signals_lagged", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn supervise_reconnects(
    session: Weak<SessionInner>,
    mut events: broadcast::Receiver<ChannelEvent>,
    policy: RetryPolicy,
) {
    let mut carried: Option<String> = None;

    loop {
        let user_id = match carried.take() {
            Some(user_id) => user_id,
            None => match events.recv().await {
                Ok(ChannelEvent::Disconnected {
                    user_id,
                    unexpected: true,
                }) => user_id,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(event = "session_channel_events_lagged", skipped);
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };

        let Some(inner) = session.upgrade() else {
            return;
        };
        if !inner.is_authenticated_as(&user_id) {
            continue;
        }

        let recovered = inner.reconnect(&user_id, &policy).await;
        // Drops emitted by our own failed attempts are stale now.
        events = events.resubscribe();
        if recovered
            && inner.channel.state() == ChannelState::Disconnected
            && inner.is_authenticated_as(&user_id)
        {
            carried = Some(user_id);
        }
    }
}
