//! HTTP side of the client.
//!
//! - `pipeline`: auth headers, single-flight refresh, FIFO replay.
//! - `services`: one typed method per backend route.
//! - `types`: request/response bodies.
//! - `error`: the per-call error taxonomy.

/// Error taxonomy and UI-facing error notices.
pub mod error;
/// Request pipeline and refresh state machine.
pub mod pipeline;
/// Typed endpoint wrappers.
pub mod services;
/// REST payload types.
pub mod types;

pub use error::{ApiError, ErrorKind, ErrorNotice};
pub use pipeline::{ApiRequest, ApiResponse, AuthSignal, RefreshState, RequestPipeline};
pub use services::TradingApi;
