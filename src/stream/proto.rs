//! Wire format of the realtime channel: typed push messages and outbound frames.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::types::{Market, OrderSide};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisProgress {
    pub task_id: String,
    /// Percent complete, 0 to 100.
    pub progress: f64,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: String,
}

impl AnalysisProgress {
    pub fn is_complete(&self) -> bool {
        self.progress >= 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketData {
    pub symbol: String,
    pub market: Market,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub volume: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradingUpdate {
    /// `order_created`, `order_filled`, `order_cancelled`, ...
    pub event: String,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    pub timestamp: String,
}

/// Subscription key: the push types this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    AnalysisProgress,
    MarketData,
    TradingUpdate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::AnalysisProgress,
        MessageKind::MarketData,
        MessageKind::TradingUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnalysisProgress => "analysis_progress",
            Self::MarketData => "market_data",
            Self::TradingUpdate => "trading_update",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded push frame. `{"type": ..., ...fields}` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    AnalysisProgress(AnalysisProgress),
    MarketData(MarketData),
    TradingUpdate(TradingUpdate),
    /// A type this client does not model. Never dispatched.
    Unknown { message_type: String, raw: Value },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownMessage {
    AnalysisProgress(AnalysisProgress),
    MarketData(MarketData),
    TradingUpdate(TradingUpdate),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no string \"type\" field")]
    MissingType,
}

impl PushMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(text)?;
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtoError::MissingType)?;

        if MessageKind::from_tag(message_type).is_none() {
            return Ok(Self::Unknown {
                message_type: message_type.to_string(),
                raw: value,
            });
        }

        Ok(match serde_json::from_value::<KnownMessage>(value)? {
            KnownMessage::AnalysisProgress(inner) => Self::AnalysisProgress(inner),
            KnownMessage::MarketData(inner) => Self::MarketData(inner),
            KnownMessage::TradingUpdate(inner) => Self::TradingUpdate(inner),
        })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            Self::AnalysisProgress(inner) => tagged(MessageKind::AnalysisProgress, inner)?,
            Self::MarketData(inner) => tagged(MessageKind::MarketData, inner)?,
            Self::TradingUpdate(inner) => tagged(MessageKind::TradingUpdate, inner)?,
            Self::Unknown { raw, .. } => raw.clone(),
        };
        serde_json::to_string(&value)
    }

    /// `None` for [`PushMessage::Unknown`].
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::AnalysisProgress(_) => Some(MessageKind::AnalysisProgress),
            Self::MarketData(_) => Some(MessageKind::MarketData),
            Self::TradingUpdate(_) => Some(MessageKind::TradingUpdate),
            Self::Unknown { .. } => None,
        }
    }

    pub fn type_tag(&self) -> &str {
        match self {
            Self::Unknown { message_type, .. } => message_type.as_str(),
            known => known.kind().map(MessageKind::as_str).unwrap_or_default(),
        }
    }
}

fn tagged<T: Serialize>(kind: MessageKind, inner: &T) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(inner)?;
    if let Value::Object(fields) = &mut value {
        fields.insert("type".to_string(), Value::String(kind.as_str().to_string()));
    }
    Ok(value)
}

/// Builds an outbound frame. Object payloads are flattened next to `type`;
/// anything else is nested under `data`.
pub fn encode_outbound(message_type: &str, payload: Value) -> Result<String, serde_json::Error> {
    let mut fields = match payload {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        other => {
            let mut fields = Map::new();
            fields.insert("data".to_string(), other);
            fields
        }
    };
    fields.insert("type".to_string(), Value::String(message_type.to_string()));
    serde_json::to_string(&Value::Object(fields))
}
