//! Session-level types: identifiers, progress, reports and the caller's handle.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{ResultSlot, SlotState};
use crate::error::{BulkCheckError, Result};
use crate::network::DispatchSettings;
use crate::validate::IdentifierKind;

/// Unique identifier for one check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        SessionId(uuid)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Completed,
    Cancelled,
}

/// Point-in-time view of a session, published after every batch.
///
/// Counts come from one read of the slot buffer, so they always add up to `total`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub state: SessionState,
    pub total: usize,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub batches_total: usize,
    pub batches_claimed: usize,
    pub batches_done: usize,
    pub active_workers: usize,
}

impl Progress {
    pub(crate) fn from_slots(slots: &[ResultSlot]) -> Self {
        let mut progress = Progress {
            state: SessionState::Running,
            total: slots.len(),
            pending: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            batches_total: 0,
            batches_claimed: 0,
            batches_done: 0,
            active_workers: 0,
        };
        for slot in slots {
            match slot.state {
                SlotState::Pending => progress.pending += 1,
                SlotState::Succeeded(_) => progress.succeeded += 1,
                SlotState::Failed(_) => progress.failed += 1,
                SlotState::Cancelled => progress.cancelled += 1,
            }
        }
        progress
    }

    /// Items with a terminal outcome.
    pub fn settled(&self) -> usize {
        self.total - self.pending
    }

    pub fn is_finished(&self) -> bool {
        self.state != SessionState::Running
    }
}

/// Final result of a session, handed to exporters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub kind: IdentifierKind,
    pub state: SessionState,
    pub settings: DispatchSettings,
    pub progress: Progress,
    pub slots: Vec<ResultSlot>,
}

/// Caller's handle on a running check.
///
/// Dropping the handle does not stop the session; call [`CheckHandle::cancel`].
#[derive(Debug)]
pub struct CheckHandle {
    pub(crate) session_id: SessionId,
    pub(crate) kind: IdentifierKind,
    pub(crate) settings: DispatchSettings,
    pub(crate) cancel: CancellationToken,
    pub(crate) slots: Arc<RwLock<Vec<ResultSlot>>>,
    pub(crate) progress: watch::Receiver<Progress>,
    pub(crate) task: JoinHandle<SessionReport>,
}

impl CheckHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Stop claiming batches and abort in-flight webhook calls.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Copy of the slot buffer as it stands right now. May mix pending and
    /// terminal slots while the session runs.
    pub fn snapshot(&self) -> Vec<ResultSlot> {
        self.slots.read().clone()
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// Receiver notified after every completed batch and once at the end.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end.
    pub async fn wait(self) -> Result<SessionReport> {
        self.task.await.map_err(|e| {
            BulkCheckError::Other(anyhow::anyhow!("Dispatch session task failed: {}", e))
        })
    }
}
