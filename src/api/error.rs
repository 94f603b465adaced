use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Failure of a single API call.
///
/// Only [`ApiError::Auth`] ends a session; every other kind is transient
/// and leaves credentials untouched.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Credentials are gone: refresh failed, no refresh token, the replayed
    /// call was rejected again, or a login was refused.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport failure or timeout.
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),

    /// 4xx other than 401.
    #[error("http status {status}: {message}")]
    Validation { status: StatusCode, message: String },

    /// 5xx.
    #[error("server error {status}: {message}")]
    Server { status: StatusCode, message: String },

    /// A successful response whose body did not match the expected shape.
    #[error("failed to parse response: {0}")]
    Decode(String),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Network,
    Validation,
    Server,
    Decode,
}

/// The `{kind, message}` object handed to the UI layer.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Network(_) => ErrorKind::Network,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Server { .. } => ErrorKind::Server,
            Self::Decode(_) => ErrorKind::Decode,
        }
    }

    pub fn notice(&self) -> ErrorNotice {
        let message = match self {
            Self::Auth(message) | Self::Decode(message) => message.clone(),
            Self::Validation { message, .. } | Self::Server { message, .. } => message.clone(),
            Self::Network(err) if err.is_timeout() => "request timed out".to_string(),
            Self::Network(err) => err.to_string(),
        };
        ErrorNotice {
            kind: self.kind(),
            message,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Validation { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Network(err) => err.status(),
            Self::Auth(_) | Self::Decode(_) => None,
        }
    }

    /// Maps a non-2xx, non-401 response onto the taxonomy.
    pub(crate) fn from_status(status: StatusCode, body: &str) -> Self {
        let message = summarize_error_body(body);
        if status.is_server_error() {
            Self::Server { status, message }
        } else {
            Self::Validation { status, message }
        }
    }
}

/// Picks the most useful human-readable line out of an error body.
///
/// The backend's middleware answers `{"error", "message", "detail"}` while
/// framework-raised errors carry only `{"detail"}`; anything else is clipped.
pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        detail: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let detail = parsed.detail.and_then(|detail| match detail {
            serde_json::Value::String(text) => Some(text),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
        if let Some(message) = parsed.message.or(detail).or(parsed.error) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
