//! Client configuration: endpoints, timeouts, locale and reconnect policy.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Local development API server.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8000";
/// Local development websocket server.
pub const LOCAL_WS_BASE_URL: &str = "ws://localhost:8000";
/// Versioned prefix shared by HTTP routes and the realtime endpoint.
pub const API_PREFIX: &str = "/api/v1";

pub const ENV_API_URL: &str = "TRADEAGENTS_API_URL";
pub const ENV_WS_URL: &str = "TRADEAGENTS_WS_URL";
pub const ENV_LOCALE: &str = "TRADEAGENTS_LOCALE";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const LOCALE: &'static str = "zh-CN";
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Origin of the HTTP API, without the `/api/v1` prefix.
    pub api_base_url: String,
    /// Origin of the realtime endpoint, without the `/api/v1` prefix.
    pub ws_base_url: String,
    pub connect_timeout: Duration,
    /// Upper bound for a single HTTP call, refresh included.
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Locale sent as `Accept-Language` until the user stores a preference.
    pub default_locale: String,
    /// Applied by the session when the channel drops while still logged in.
    pub reconnect_policy: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: LOCAL_API_BASE_URL.to_string(),
            ws_base_url: LOCAL_WS_BASE_URL.to_string(),
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            request_timeout: ClientDefaults::REQUEST_TIMEOUT,
            handshake_timeout: ClientDefaults::HANDSHAKE_TIMEOUT,
            default_locale: ClientDefaults::LOCALE.to_string(),
            reconnect_policy: RetryPolicy::reconnect(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `TRADEAGENTS_API_URL`, `TRADEAGENTS_WS_URL`
    /// and `TRADEAGENTS_LOCALE` when they are set and non-empty.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();
        if let Some(url) = read(ENV_API_URL) {
            config = config.with_api_base_url(url);
        }
        if let Some(url) = read(ENV_WS_URL) {
            config = config.with_ws_base_url(url);
        }
        if let Some(locale) = read(ENV_LOCALE) {
            config.default_locale = locale;
        }
        config
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = normalize_origin(url.into());
        self
    }

    pub fn with_ws_base_url(mut self, url: impl Into<String>) -> Self {
        self.ws_base_url = normalize_origin(url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_default_locale(mut self, locale: impl Into<String>) -> Self {
        self.default_locale = locale.into();
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Full URL for an API route such as `/users/me`.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.api_base_url, API_PREFIX, path)
    }

    /// Realtime endpoint scoped to one user.
    pub fn ws_url(&self, user_id: &str) -> String {
        format!(
            "{}{}/ws/{}",
            self.ws_base_url,
            API_PREFIX,
            urlencoding::encode(user_id)
        )
    }
}

fn normalize_origin(url: String) -> String {
    url.trim().trim_end_matches('/').to_string()
}
