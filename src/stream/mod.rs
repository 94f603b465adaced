//! Realtime push modules.
//!
//! - `channel`: websocket connection bound to one user, with a background
//!   reader that feeds the registry.
//! - `proto`: push message envelopes and outbound frame encoding.
//! - `registry`: per-kind handler lists and subscription handles.

/// Websocket channel and its lifecycle events.
pub mod channel;
/// Push message types.
pub mod proto;
/// Subscription registry.
pub mod registry;

pub use channel::{ChannelError, ChannelEvent, ChannelState, RealtimeChannel};
pub use proto::{AnalysisProgress, MarketData, MessageKind, PushMessage, TradingUpdate};
pub use registry::{SubscriptionHandle, SubscriptionId, SubscriptionRegistry};
