#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::header::{HeaderName, ACCEPT_LANGUAGE, AUTHORIZATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tradeagents_client::ClientConfig;

pub const USER_ID: &str = "u-1";
pub const USERNAME: &str = "trader";
pub const PASSWORD: &str = "secret";
pub const INITIAL_ACCESS: &str = "acc-0";
pub const INITIAL_REFRESH: &str = "ref-0";

#[derive(Clone, Debug)]
enum WsCommand {
    Push(String),
    DropAll,
}

struct BackendState {
    access: Mutex<String>,
    refresh: Mutex<String>,
    refresh_accepted: Mutex<bool>,
    refresh_calls: AtomicUsize,
    gate: watch::Sender<bool>,
    hold: watch::Sender<bool>,
    held_arrivals: AtomicUsize,
    served: Mutex<Vec<String>>,
    ws_commands: broadcast::Sender<WsCommand>,
    ws_connections: AtomicUsize,
    ws_live: AtomicUsize,
    ws_received: Mutex<Vec<String>>,
}

/// In-process stand-in for the REST API and the realtime endpoint.
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let (gate, _) = watch::channel(true);
        let (hold, _) = watch::channel(true);
        let (ws_commands, _) = broadcast::channel(64);
        let state = Arc::new(BackendState {
            access: Mutex::new(INITIAL_ACCESS.to_string()),
            refresh: Mutex::new(INITIAL_REFRESH.to_string()),
            refresh_accepted: Mutex::new(true),
            refresh_calls: AtomicUsize::new(0),
            gate,
            hold,
            held_arrivals: AtomicUsize::new(0),
            served: Mutex::new(Vec::new()),
            ws_commands,
            ws_connections: AtomicUsize::new(0),
            ws_live: AtomicUsize::new(0),
            ws_received: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/api/v1/auth/login", post(login_handler))
            .route("/api/v1/auth/refresh", post(refresh_handler))
            .route("/api/v1/users/me", get(me_handler))
            .route("/api/v1/probe/{tag}", get(probe_handler))
            .route("/api/v1/held/{tag}", get(held_handler))
            .route("/api/v1/sleep/{millis}", get(sleep_handler))
            .route("/api/v1/echo", get(echo_handler))
            .route("/api/v1/always-401", get(always_unauthorized_handler))
            .route("/api/v1/status/{code}", get(status_handler))
            .route("/api/v1/ws/{user_id}", get(ws_handler))
            .with_state(Arc::clone(&state));

        let (addr, shutdown) = spawn_server(app).await;
        Self {
            addr,
            state,
            shutdown: Some(shutdown),
        }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_api_base_url(format!("http://{}", self.addr))
            .with_ws_base_url(format!("ws://{}", self.addr))
            .with_request_timeout(Duration::from_secs(5))
            .with_handshake_timeout(Duration::from_secs(5))
    }

    /// Invalidates the current access token so the next call gets a 401.
    pub fn expire_access(&self) {
        *self.state.access.lock().unwrap() = "expired".to_string();
    }

    pub fn current_access(&self) -> String {
        self.state.access.lock().unwrap().clone()
    }

    pub fn current_refresh(&self) -> String {
        self.state.refresh.lock().unwrap().clone()
    }

    pub fn reject_refresh(&self) {
        *self.state.refresh_accepted.lock().unwrap() = false;
    }

    /// Holds `POST /auth/refresh` until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.state.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.state.gate.send_replace(true);
    }

    /// Parks `/held/{tag}` calls after they arrive, before their token is
    /// checked, until [`release_held`](Self::release_held).
    pub fn hold_requests(&self) {
        self.state.hold.send_replace(false);
    }

    pub fn release_held(&self) {
        self.state.hold.send_replace(true);
    }

    /// Number of `/held/{tag}` calls that reached the server, replays included.
    pub fn held_arrivals(&self) -> usize {
        self.state.held_arrivals.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    /// Tags of `/probe/{tag}` calls that succeeded, in arrival order.
    pub fn served(&self) -> Vec<String> {
        self.state.served.lock().unwrap().clone()
    }

    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.state.ws_commands.send(WsCommand::Push(frame.into()));
    }

    /// Closes every open socket from the server side.
    pub fn drop_sockets(&self) {
        let _ = self.state.ws_commands.send(WsCommand::DropAll);
    }

    pub fn ws_connections(&self) -> usize {
        self.state.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ws_live(&self) -> usize {
        self.state.ws_live.load(Ordering::SeqCst)
    }

    pub fn ws_received(&self) -> Vec<String> {
        self.state.ws_received.lock().unwrap().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn user_json() -> Value {
    json!({
        "id": USER_ID,
        "username": USERNAME,
        "email": "trader@example.com",
        "preferred_language": "zh-CN"
    })
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn authorized(state: &BackendState, headers: &HeaderMap) -> bool {
    let access = state.access.lock().unwrap();
    bearer(headers) == Some(access.as_str())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "Could not validate credentials"})),
    )
        .into_response()
}

async fn login_handler(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    let valid = body["username"] == USERNAME && body["password"] == PASSWORD;
    if !valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Incorrect username or password"})),
        )
            .into_response();
    }

    let access = state.access.lock().unwrap().clone();
    let refresh = state.refresh.lock().unwrap().clone();
    Json(json!({
        "access_token": access,
        "refresh_token": refresh,
        "token_type": "bearer",
        "user": user_json(),
    }))
    .into_response()
}

async fn refresh_handler(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    let call = state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;

    let mut gate = state.gate.subscribe();
    let _ = gate.wait_for(|open| *open).await;

    let accepted = *state.refresh_accepted.lock().unwrap();
    let matches = {
        let refresh = state.refresh.lock().unwrap();
        body["refresh_token"].as_str() == Some(refresh.as_str())
    };
    if !accepted || !matches {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid refresh token"})),
        )
            .into_response();
    }

    let access = format!("acc-{call}");
    let refresh = format!("ref-{call}");
    *state.access.lock().unwrap() = access.clone();
    *state.refresh.lock().unwrap() = refresh.clone();
    Json(json!({"access_token": access, "refresh_token": refresh, "token_type": "bearer"}))
        .into_response()
}

async fn me_handler(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    Json(user_json()).into_response()
}

async fn probe_handler(
    State(state): State<Arc<BackendState>>,
    Path(tag): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    state.served.lock().unwrap().push(tag.clone());
    Json(json!({"tag": tag})).into_response()
}

async fn held_handler(
    State(state): State<Arc<BackendState>>,
    Path(tag): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.held_arrivals.fetch_add(1, Ordering::SeqCst);
    let mut hold = state.hold.subscribe();
    let _ = hold.wait_for(|open| *open).await;
    probe_handler(State(state), Path(tag), headers).await
}

async fn sleep_handler(Path(millis): Path<u64>) -> Response {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Json(json!({"slept": millis})).into_response()
}

async fn echo_handler(headers: HeaderMap) -> Response {
    let header = |name: HeaderName| {
        headers
            .get(&name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    Json(json!({
        "authorization": header(AUTHORIZATION),
        "accept_language": header(ACCEPT_LANGUAGE),
    }))
    .into_response()
}

async fn always_unauthorized_handler() -> Response {
    unauthorized()
}

async fn status_handler(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({"error": "mock", "message": format!("forced {code}")})),
    )
        .into_response()
}

async fn ws_handler(
    State(state): State<Arc<BackendState>>,
    Path(_user_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    let commands = state.ws_commands.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, state, commands))
        .into_response()
}

async fn serve_socket(
    mut socket: WebSocket,
    state: Arc<BackendState>,
    mut commands: broadcast::Receiver<WsCommand>,
) {
    state.ws_live.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(WsCommand::Push(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(WsCommand::DropAll) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.ws_received.lock().unwrap().push(text.as_str().to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    state.ws_live.fetch_sub(1, Ordering::SeqCst);
}

async fn spawn_server(app: Router) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx)
}
