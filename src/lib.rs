//! Bulk status checks for phone numbers and voucher serials over a webhook.
//!
//! A caller hands the [`Dispatcher`] a list of identifiers and a pool of API
//! tokens. The list is deduplicated, cut into fixed-size batches, and the
//! batches are sent concurrently (one worker per token, each batch with its
//! rotated token) to a single webhook. Every identifier owns one
//! [`ResultSlot`](domain::ResultSlot) addressed by its position in the
//! deduplicated list, so results are written back at the right index whatever
//! order batches finish in.
//!
//! Throughput settings come from a coarse network-quality estimate
//! ([`network::current_settings`]); retries use exponential backoff with jitter
//! and wait out offline periods without spending attempts.

pub mod aggregate;
pub mod batching;
pub mod config;
pub mod connectivity;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod http;
pub mod network;
pub mod retry;
pub mod tokens;
pub mod validate;

// Re-export commonly used types
pub use config::{CancelPolicy, DispatcherConfig};
pub use connectivity::{ConnectionInfo, ConnectivityMonitor};
pub use dispatch::{CheckHandle, Dispatcher, Progress, SessionId, SessionReport, SessionState};
pub use domain::*;
pub use error::{BulkCheckError, Result};
pub use http::{
    HttpClient, HttpResponse, MockHttpClient, ReqwestHttpClient, WebhookPayload, WebhookRequest,
};
pub use network::{DispatchSettings, NetworkQuality};
pub use retry::RetryPolicy;
pub use tokens::TokenPool;
pub use validate::{IdentifierKind, ValidationRules, VoucherRule};
