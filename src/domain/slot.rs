//! Per-identifier result slots.
//!
//! A session owns one slot per submitted identifier, addressed by absolute index.
//! Each slot starts `Pending` and receives exactly one terminal write:
//!
//! ```text
//! Pending ──> Succeeded
//!         ──> Failed
//!         ──> Cancelled
//! ```

use serde::{Deserialize, Serialize};

use super::outcome::CheckOutcome;

/// Why an identifier failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// Rejected by client-side validation; never sent over the network.
    InvalidFormat { reason: String },

    /// The webhook answered with a non-2xx status (after any retries).
    HttpStatus { status: u16 },

    /// Every attempt hit its deadline.
    Timeout,

    /// Transport-level failure (refused, reset, DNS).
    Connection { error: String },

    /// Any other failure while talking to the webhook.
    Network { error: String },

    /// A 2xx body that matched none of the accepted shapes.
    MalformedResponse { error: String },

    /// The response carried fewer records than identifiers sent.
    MissingResult,
}

impl FailureReason {
    /// Short operator-facing message.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::InvalidFormat { reason } => reason.clone(),
            FailureReason::HttpStatus { status } => format!("HTTP {status}: request rejected"),
            FailureReason::Timeout => "request timed out".to_string(),
            FailureReason::Connection { .. } => "connection failed".to_string(),
            FailureReason::Network { .. } => "network error".to_string(),
            FailureReason::MalformedResponse { .. } => "unreadable response".to_string(),
            FailureReason::MissingResult => "no result returned".to_string(),
        }
    }

    /// Label used on metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::InvalidFormat { .. } => "invalid_format",
            FailureReason::HttpStatus { .. } => "http_status",
            FailureReason::Timeout => "timeout",
            FailureReason::Connection { .. } => "connection",
            FailureReason::Network { .. } => "network",
            FailureReason::MalformedResponse { .. } => "malformed_response",
            FailureReason::MissingResult => "missing_result",
        }
    }
}

/// Lifecycle state of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum SlotState {
    Pending,
    Succeeded(CheckOutcome),
    Failed(FailureReason),
    Cancelled,
}

/// An identifier and its outcome at a fixed index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSlot {
    pub index: usize,
    pub identifier: String,
    pub state: SlotState,
}

impl ResultSlot {
    pub fn pending(index: usize, identifier: impl Into<String>) -> Self {
        Self {
            index,
            identifier: identifier.into(),
            state: SlotState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, SlotState::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self.state, SlotState::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SlotState::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, SlotState::Cancelled)
    }

    pub fn variant(&self) -> &'static str {
        match self.state {
            SlotState::Pending => "Pending",
            SlotState::Succeeded(_) => "Succeeded",
            SlotState::Failed(_) => "Failed",
            SlotState::Cancelled => "Cancelled",
        }
    }

    pub fn outcome(&self) -> Option<&CheckOutcome> {
        match &self.state {
            SlotState::Succeeded(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.state {
            SlotState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Apply a terminal state. Returns `false` (and changes nothing) if the slot
    /// was already terminal.
    pub fn settle(&mut self, state: SlotState) -> bool {
        if self.is_terminal() {
            tracing::warn!(
                index = self.index,
                current = self.variant(),
                "Ignoring second terminal write to slot"
            );
            return false;
        }
        self.state = state;
        true
    }
}
