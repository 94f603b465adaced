//! Authenticated request pipeline with single-flight token refresh.
//!
//! Every HTTP call goes through [`RequestPipeline::execute`]. A 401 parks the
//! call in a FIFO queue and, if no refresh is running, starts exactly one
//! `POST /auth/refresh` on a detached task. When it lands the queue is
//! replayed in arrival order with the new token; when it fails every queued
//! call is rejected with [`ApiError::Auth`], the tokens are wiped and
//! [`AuthSignal::RefreshRejected`] is broadcast once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::header::ACCEPT_LANGUAGE;
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::api::error::{summarize_error_body, ApiError};
use crate::config::ClientConfig;
use crate::credentials::{
    save_token_pair, CredentialStore, CredentialStoreError, TokenPair, ACCESS_TOKEN_KEY,
    LANGUAGE_KEY, REFRESH_TOKEN_KEY,
};

pub(crate) const REFRESH_PATH: &str = "/auth/refresh";
const AUTH_SIGNAL_CAPACITY: usize = 16;

/// An outbound call, independent of credentials.
///
/// The pipeline clones it for every attempt and attaches headers to the
/// outgoing request only, so the caller's value is never touched.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Route below `/api/v1`, e.g. `/users/me`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Whether a 401 should go through token refresh. Off for login.
    pub refresh_on_unauthorized: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            refresh_on_unauthorized: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|err| ApiError::Decode(format!("failed to encode request body: {err}")))?;
        self.body = Some(value);
        Ok(self)
    }

    /// Surfaces a 401 as [`ApiError::Auth`] instead of refreshing.
    pub fn without_refresh(mut self) -> Self {
        self.refresh_on_unauthorized = false;
        self
    }
}

/// A 2xx response with its raw body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Broadcast when credentials cannot be recovered and the session must end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthSignal {
    RefreshRejected,
}

struct PendingCall {
    request: ApiRequest,
    respond_to: oneshot::Sender<Result<ApiResponse, ApiError>>,
}

struct RefreshSlot {
    state: RefreshState,
    pending: VecDeque<PendingCall>,
}

enum Attempt {
    Completed(Result<ApiResponse, ApiError>),
    Unauthorized(String),
}

enum Recovery {
    /// A refresh finished after this call was sent; try the newer token.
    RetryWith(String),
    /// The tokens this call was sent with were already cleared by a failed
    /// refresh; that episode has signalled.
    Reject(String),
    Wait {
        response: oneshot::Receiver<Result<ApiResponse, ApiError>>,
        start_refresh: bool,
    },
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Shared handle; clones see the same tokens, queue and refresh state.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    http: Client,
    config: ClientConfig,
    store: Arc<dyn CredentialStore>,
    refresh: Mutex<RefreshSlot>,
    signals: broadcast::Sender<AuthSignal>,
}

impl RequestPipeline {
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(ApiError::Network)?;
        let (signals, _) = broadcast::channel(AUTH_SIGNAL_CAPACITY);

        Ok(Self {
            inner: Arc::new(PipelineInner {
                http,
                config,
                store,
                refresh: Mutex::new(RefreshSlot {
                    state: RefreshState::Idle,
                    pending: VecDeque::new(),
                }),
                signals,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Sends `request`, recovering transparently from one expired access
    /// token.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        if let Some(response) = self.inner.enqueue_if_refreshing(request) {
            debug!(event = "api_request_queued", path = %request.path);
            return await_pending(response).await;
        }

        let sent_with = self.inner.access_token();
        let message = match self.inner.send(request, sent_with.as_deref()).await {
            Attempt::Completed(result) => return result,
            Attempt::Unauthorized(message) => message,
        };

        if !request.refresh_on_unauthorized {
            return Err(ApiError::Auth(message));
        }

        match self.inner.begin_recovery(request, sent_with.as_deref(), &message) {
            Recovery::RetryWith(token) => {
                debug!(event = "api_request_stale_token_retry", path = %request.path);
                self.inner.replay(request, &token).await
            }
            Recovery::Reject(message) => {
                debug!(event = "api_request_signed_out", path = %request.path);
                Err(ApiError::Auth(message))
            }
            Recovery::Wait {
                response,
                start_refresh,
            } => {
                if start_refresh {
                    info!(event = "token_refresh_started", path = %request.path);
                    tokio::spawn(Arc::clone(&self.inner).run_refresh());
                }
                await_pending(response).await
            }
        }
    }

    /// [`execute`](Self::execute) followed by JSON decoding of the body.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, ApiError> {
        self.execute(request).await?.json()
    }

    pub fn install_tokens(&self, tokens: &TokenPair) -> Result<(), CredentialStoreError> {
        save_token_pair(self.inner.store.as_ref(), tokens)
    }

    pub fn clear_tokens(&self) -> Result<(), CredentialStoreError> {
        self.inner.clear_tokens()
    }

    /// Current access token, read from the store at call time.
    pub fn access_token(&self) -> Option<SecretString> {
        self.inner.access_token().map(SecretString::new)
    }

    pub fn has_credentials(&self) -> bool {
        self.inner.store.get(ACCESS_TOKEN_KEY).is_some()
            || self.inner.store.get(REFRESH_TOKEN_KEY).is_some()
    }

    pub fn locale(&self) -> String {
        self.inner.locale()
    }

    pub fn set_locale(&self, locale: &str) -> Result<(), CredentialStoreError> {
        self.inner.store.set(LANGUAGE_KEY, locale)
    }

    pub fn subscribe_auth_signals(&self) -> broadcast::Receiver<AuthSignal> {
        self.inner.signals.subscribe()
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.inner.lock_slot().state
    }

    /// Calls parked behind the in-flight refresh.
    pub fn queued_calls(&self) -> usize {
        self.inner.lock_slot().pending.len()
    }
}

impl PipelineInner {
    fn lock_slot(&self) -> MutexGuard<'_, RefreshSlot> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn access_token(&self) -> Option<String> {
        self.store.get(ACCESS_TOKEN_KEY)
    }

    fn locale(&self) -> String {
        self.store
            .get(LANGUAGE_KEY)
            .unwrap_or_else(|| self.config.default_locale.clone())
    }

    /// Removes both tokens even when the first removal fails; reports the
    /// first error.
    fn clear_tokens(&self) -> Result<(), CredentialStoreError> {
        let access = self.store.remove(ACCESS_TOKEN_KEY);
        let refresh = self.store.remove(REFRESH_TOKEN_KEY);
        access.and(refresh)
    }

    fn park(slot: &mut RefreshSlot, request: &ApiRequest) -> oneshot::Receiver<Result<ApiResponse, ApiError>> {
        let (respond_to, response) = oneshot::channel();
        slot.pending.push_back(PendingCall {
            request: request.clone(),
            respond_to,
        });
        response
    }

    fn enqueue_if_refreshing(
        &self,
        request: &ApiRequest,
    ) -> Option<oneshot::Receiver<Result<ApiResponse, ApiError>>> {
        if !request.refresh_on_unauthorized {
            return None;
        }
        let mut slot = self.lock_slot();
        (slot.state == RefreshState::Refreshing).then(|| Self::park(&mut slot, request))
    }

    fn begin_recovery(
        &self,
        request: &ApiRequest,
        sent_with: Option<&str>,
        message: &str,
    ) -> Recovery {
        let mut slot = self.lock_slot();

        if slot.state == RefreshState::Idle {
            match self.access_token() {
                Some(current) if Some(current.as_str()) != sent_with => {
                    return Recovery::RetryWith(current);
                }
                None if sent_with.is_some() => {
                    return Recovery::Reject(format!("signed out while in flight: {message}"));
                }
                _ => {}
            }
        }

        let response = Self::park(&mut slot, request);
        let start_refresh = slot.state == RefreshState::Idle;
        slot.state = RefreshState::Refreshing;
        Recovery::Wait {
            response,
            start_refresh,
        }
    }

    fn finish_refresh(&self) -> VecDeque<PendingCall> {
        let mut slot = self.lock_slot();
        slot.state = RefreshState::Idle;
        std::mem::take(&mut slot.pending)
    }

    async fn run_refresh(self: Arc<Self>) {
        match self.request_refresh().await {
            Ok(access) => {
                let pending = self.finish_refresh();
                info!(event = "token_refresh_succeeded", queued = pending.len());
                for call in pending {
                    let result = self.replay(&call.request, access.expose_secret()).await;
                    let _ = call.respond_to.send(result);
                }
            }
            Err(err) => {
                warn!(event = "token_refresh_failed", error = %err);
                if let Err(store_err) = self.clear_tokens() {
                    warn!(event = "credential_clear_failed", error = %store_err);
                }
                let pending = self.finish_refresh();
                let reason = format!("token refresh failed: {err}");
                for call in pending {
                    let _ = call.respond_to.send(Err(ApiError::Auth(reason.clone())));
                }
                let _ = self.signals.send(AuthSignal::RefreshRejected);
            }
        }
    }

    async fn request_refresh(&self) -> Result<SecretString, ApiError> {
        let refresh_token = self
            .store
            .get(REFRESH_TOKEN_KEY)
            .ok_or_else(|| ApiError::Auth("no refresh token stored".to_string()))?;

        let response = self
            .http
            .post(self.config.api_url(REFRESH_PATH))
            .timeout(self.config.request_timeout)
            .header(ACCEPT_LANGUAGE, self.locale())
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await
            .map_err(ApiError::Network)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Network)?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Auth(summarize_error_body(&body)));
        }
        if !status.is_success() {
            return Err(ApiError::from_status(status, &body));
        }

        let parsed: RefreshResponse =
            serde_json::from_str(&body).map_err(|err| ApiError::Decode(err.to_string()))?;

        if let Err(err) = self.store.set(ACCESS_TOKEN_KEY, &parsed.access_token) {
            warn!(event = "credential_persist_failed", key = ACCESS_TOKEN_KEY, error = %err);
        }
        if let Some(rotated) = parsed.refresh_token.as_deref() {
            if let Err(err) = self.store.set(REFRESH_TOKEN_KEY, rotated) {
                warn!(event = "credential_persist_failed", key = REFRESH_TOKEN_KEY, error = %err);
            }
        }

        Ok(SecretString::new(parsed.access_token))
    }

    async fn replay(&self, request: &ApiRequest, token: &str) -> Result<ApiResponse, ApiError> {
        match self.send(request, Some(token)).await {
            Attempt::Completed(result) => result,
            Attempt::Unauthorized(message) => Err(ApiError::Auth(format!(
                "rejected after token refresh: {message}"
            ))),
        }
    }

    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> Attempt {
        let mut builder = self
            .http
            .request(request.method.clone(), self.config.api_url(&request.path))
            .timeout(self.config.request_timeout)
            .header(ACCEPT_LANGUAGE, self.locale());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(event = "api_request_failed", method = %request.method, path = %request.path, error = %err);
                return Attempt::Completed(Err(ApiError::Network(err)));
            }
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => return Attempt::Completed(Err(ApiError::Network(err))),
        };
        debug!(
            event = "api_request",
            method = %request.method,
            path = %request.path,
            status = status.as_u16()
        );

        if status == StatusCode::UNAUTHORIZED {
            return Attempt::Unauthorized(summarize_error_body(&body));
        }
        if !status.is_success() {
            return Attempt::Completed(Err(ApiError::from_status(status, &body)));
        }
        Attempt::Completed(Ok(ApiResponse { status, body }))
    }
}

async fn await_pending(
    response: oneshot::Receiver<Result<ApiResponse, ApiError>>,
) -> Result<ApiResponse, ApiError> {
    response.await.unwrap_or_else(|_| {
        Err(ApiError::Auth(
            "token refresh stopped before completing".to_string(),
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::Method;
    use serde_json::json;

    use super::{ApiRequest, ApiResponse, RefreshState, RequestPipeline};
    use crate::api::error::ErrorKind;
    use crate::config::ClientConfig;
    use crate::credentials::{
        CredentialStore, CredentialStoreError, MemoryCredentialStore, TokenPair, ACCESS_TOKEN_KEY,
        LANGUAGE_KEY, REFRESH_TOKEN_KEY,
    };

    /// Refuses to remove the access token.
    #[derive(Default)]
    struct StuckAccessStore {
        entries: MemoryCredentialStore,
    }

    impl CredentialStore for StuckAccessStore {
        fn get(&self, key: &str) -> Option<String> {
            self.entries.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), CredentialStoreError> {
            self.entries.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), CredentialStoreError> {
            if key == ACCESS_TOKEN_KEY {
                return Err(CredentialStoreError::Poisoned);
            }
            self.entries.remove(key)
        }
    }

    fn pipeline_with(config: ClientConfig) -> (RequestPipeline, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let pipeline = RequestPipeline::new(config, store.clone()).expect("pipeline");
        (pipeline, store)
    }

    #[test]
    fn request_builders_fill_fields() {
        let request = ApiRequest::get("/stocks/search")
            .with_query("q", "600519")
            .with_query("page", 2);
        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.query,
            vec![
                ("q".to_string(), "600519".to_string()),
                ("page".to_string(), "2".to_string())
            ]
        );
        assert!(request.refresh_on_unauthorized);

        let login = ApiRequest::post("/auth/login")
            .with_json(&json!({"username": "u", "password": "p"}))
            .expect("encode")
            .without_refresh();
        assert!(!login.refresh_on_unauthorized);
        assert_eq!(login.body, Some(json!({"username": "u", "password": "p"})));
    }

    #[test]
    fn response_json_decode_error_is_decode_kind() {
        let response = ApiResponse {
            status: reqwest::StatusCode::OK,
            body: "<html>".to_string(),
        };
        let err = response.json::<serde_json::Value>().expect_err("not json");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn locale_falls_back_to_config_then_prefers_store() {
        let (pipeline, store) = pipeline_with(ClientConfig::default().with_default_locale("en-US"));
        assert_eq!(pipeline.locale(), "en-US");

        pipeline.set_locale("zh-CN").expect("set locale");
        assert_eq!(store.get(LANGUAGE_KEY).as_deref(), Some("zh-CN"));
        assert_eq!(pipeline.locale(), "zh-CN");
    }

    #[test]
    fn tokens_install_and_clear_through_store() {
        let (pipeline, _store) = pipeline_with(ClientConfig::default());
        assert!(!pipeline.has_credentials());
        assert!(pipeline.access_token().is_none());

        pipeline
            .install_tokens(&TokenPair::new("acc", "ref"))
            .expect("install");
        assert!(pipeline.has_credentials());

        pipeline.clear_tokens().expect("clear");
        pipeline.clear_tokens().expect("clear twice");
        assert!(!pipeline.has_credentials());
        assert_eq!(pipeline.refresh_state(), RefreshState::Idle);
    }

    #[test]
    fn clear_tokens_removes_refresh_token_when_access_removal_fails() {
        let store = Arc::new(StuckAccessStore::default());
        let pipeline = RequestPipeline::new(ClientConfig::default(), store.clone()).expect("pipeline");
        pipeline
            .install_tokens(&TokenPair::new("acc", "ref"))
            .expect("install");

        let err = pipeline.clear_tokens().expect_err("access removal fails");
        assert!(matches!(err, CredentialStoreError::Poisoned));
        assert_eq!(store.get(REFRESH_TOKEN_KEY), None);
        assert_eq!(store.get(ACCESS_TOKEN_KEY).as_deref(), Some("acc"));
    }

    #[tokio::test]
    async fn transport_failure_is_network_and_never_refreshes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let config = ClientConfig::default()
            .with_api_base_url(format!("http://{addr}"))
            .with_request_timeout(Duration::from_secs(2));
        let (pipeline, _store) = pipeline_with(config);
        pipeline
            .install_tokens(&TokenPair::new("acc", "ref"))
            .expect("install");

        let err = pipeline
            .execute(&ApiRequest::get("/users/me"))
            .await
            .expect_err("nothing is listening");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(pipeline.refresh_state(), RefreshState::Idle);
        assert_eq!(pipeline.queued_calls(), 0);
        assert!(pipeline.has_credentials());
    }
}
