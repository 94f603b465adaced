//! Session-resilient client for the TradeAgents analysis and paper-trading
//! backend.
//!
//! The crate is organized by concern:
//! - `api`: authenticated HTTP pipeline with single-flight token refresh,
//!   plus typed endpoint wrappers.
//! - `stream`: realtime websocket channel and per-kind push subscriptions.
//! - `session`: login/logout lifecycle tying the two together.
//! - `credentials`: key-value persistence seam for tokens and locale.
//! - `config`: endpoints, timeouts and environment overrides.
//! - `retry`: shared retry and timeout utilities.

/// REST pipeline, endpoint wrappers and error taxonomy.
pub mod api;
/// Client configuration.
pub mod config;
/// Token and locale persistence.
pub mod credentials;
/// Retry and timeout helpers used across the client.
pub mod retry;
/// Session lifecycle controller.
pub mod session;
/// Realtime channel, push protocol and subscription registry.
pub mod stream;

pub use api::{ApiError, ApiRequest, ApiResponse, ErrorKind, ErrorNotice, RequestPipeline, TradingApi};
pub use config::ClientConfig;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenPair};
pub use session::{LogoutReason, Session, SessionController, SessionError, SessionEvent};
pub use stream::{MessageKind, PushMessage, RealtimeChannel, SubscriptionHandle};
