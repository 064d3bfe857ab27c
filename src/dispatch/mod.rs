//! Batch dispatcher: runs a bounded pool of workers over the batches of one
//! check session.
//!
//! Batches are claimed strictly in order. A claim needs a permit from a
//! semaphore sized to the token pool, so at most one batch per token is in
//! flight. Each claimed batch is validated, sent with its rotated token, and its
//! response merged into the slots it owns. Batches own disjoint index ranges, so
//! completion order across batches does not matter.
//!
//! Cancellation flips the session's token: the claim loop stops, in-flight
//! fetches return [`BulkCheckError::Cancelled`], and once every worker has
//! drained the [`CancelPolicy`] is applied to whatever is still pending.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use parking_lot::RwLock;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{ValidItem, merge_batch_response};
use crate::batching::{Batch, make_batches};
use crate::config::{CancelPolicy, DispatcherConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::domain::{FailureReason, ResultSlot, SlotState};
use crate::error::{BulkCheckError, Result};
use crate::http::{HttpClient, WebhookPayload, WebhookRequest};
use crate::network::{DispatchSettings, current_settings};
use crate::retry::{RetryPolicy, fetch_with_retry};
use crate::tokens::TokenPool;
use crate::validate::{IdentifierKind, ValidationRules, dedup_identifiers};

pub mod types;

pub use types::{CheckHandle, Progress, SessionId, SessionReport, SessionState};

/// Entry point for bulk checks.
///
/// Holds the HTTP client, connectivity state and configuration shared by all
/// sessions, and enforces one running session per [`IdentifierKind`].
pub struct Dispatcher<H>
where
    H: HttpClient,
{
    http_client: H,
    connectivity: ConnectivityMonitor,
    config: Arc<DispatcherConfig>,
    active_sessions: Arc<DashMap<IdentifierKind, SessionId>>,
}

impl<H> Dispatcher<H>
where
    H: HttpClient + 'static,
{
    pub fn new(
        http_client: H,
        connectivity: ConnectivityMonitor,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            http_client,
            connectivity,
            config: Arc::new(config),
            active_sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Whether a session of `kind` is still running.
    pub fn is_running(&self, kind: IdentifierKind) -> bool {
        self.active_sessions.contains_key(&kind)
    }

    /// Start a check over `identifiers` using `tokens` for authentication.
    ///
    /// Identifiers are trimmed and deduplicated (first occurrence wins) before
    /// slots are allocated; slot `i` is the `i`-th surviving identifier.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - [`BulkCheckError::EmptyTokenPool`] if no usable token is supplied
    /// - [`BulkCheckError::Offline`] if the device is offline and no settings override is
    ///   configured
    /// - [`BulkCheckError::SessionActive`] if a session of the same kind is running
    /// - [`BulkCheckError::ValidationError`] if the configured batch size is zero
    pub fn run_batch_check<I, S, T, U>(
        &self,
        identifiers: I,
        tokens: T,
        kind: IdentifierKind,
    ) -> Result<CheckHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        T: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        let tokens = TokenPool::new(tokens)?;
        let identifiers = dedup_identifiers(identifiers);

        let settings = match self.config.settings_override {
            Some(settings) => settings,
            None => current_settings(&self.connectivity.info()).ok_or_else(|| {
                tracing::warn!(%kind, "Refusing to start check while offline");
                BulkCheckError::Offline
            })?,
        };

        let batches = make_batches(&identifiers, settings.batch_size)?;

        let session_id = SessionId::new();
        match self.active_sessions.entry(kind) {
            Entry::Occupied(_) => return Err(BulkCheckError::SessionActive(kind)),
            Entry::Vacant(entry) => {
                entry.insert(session_id);
            }
        }

        let mut workers = tokens.len().min(batches.len());
        if self.config.cap_workers_to_network_concurrency {
            workers = workers.min(settings.concurrency.max(1));
        }

        let slots: Vec<ResultSlot> = identifiers
            .iter()
            .enumerate()
            .map(|(index, identifier)| ResultSlot::pending(index, identifier.as_str()))
            .collect();
        let mut initial = Progress::from_slots(&slots);
        initial.batches_total = batches.len();
        let (progress_tx, progress_rx) = watch::channel(initial);

        let cancel = CancellationToken::new();
        let slots = Arc::new(RwLock::new(slots));

        let session = Arc::new(DispatchSession {
            id: session_id,
            kind,
            settings,
            retry_policy: RetryPolicy::new(&settings, &self.config),
            rules: self.config.validation.clone(),
            cancel_policy: self.config.cancel_policy,
            webhook_url: self.config.webhook_url.clone(),
            http_client: self.http_client.clone(),
            connectivity: self.connectivity.clone(),
            tokens,
            batches,
            slots: slots.clone(),
            cancel: cancel.clone(),
            batches_claimed: AtomicUsize::new(0),
            batches_done: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            progress_tx,
        });

        tracing::info!(
            session_id = %session_id,
            %kind,
            identifiers = identifiers.len(),
            batches = session.batches.len(),
            workers,
            batch_size = settings.batch_size,
            timeout_ms = settings.timeout_ms,
            max_retries = settings.max_retries,
            "Starting bulk check"
        );

        let active_sessions = self.active_sessions.clone();
        let task = tokio::spawn(async move {
            // Release the per-kind slot however the session ends
            let _release = scopeguard::guard((), move |_| {
                active_sessions.remove_if(&kind, |_, id| *id == session_id);
            });
            session.run(workers).await
        });

        Ok(CheckHandle {
            session_id,
            kind,
            settings,
            cancel,
            slots,
            progress: progress_rx,
            task,
        })
    }
}

/// State of one check run, shared by the claim loop and its workers.
struct DispatchSession<H>
where
    H: HttpClient,
{
    id: SessionId,
    kind: IdentifierKind,
    settings: DispatchSettings,
    retry_policy: RetryPolicy,
    rules: ValidationRules,
    cancel_policy: CancelPolicy,
    webhook_url: String,
    http_client: H,
    connectivity: ConnectivityMonitor,
    tokens: TokenPool,
    batches: Vec<Batch<String>>,
    slots: Arc<RwLock<Vec<ResultSlot>>>,
    cancel: CancellationToken,
    batches_claimed: AtomicUsize,
    batches_done: AtomicUsize,
    active_workers: AtomicUsize,
    progress_tx: watch::Sender<Progress>,
}

impl<H> DispatchSession<H>
where
    H: HttpClient + 'static,
{
    #[tracing::instrument(skip(self), fields(session_id = %self.id, kind = %self.kind))]
    async fn run(self: Arc<Self>, workers: usize) -> SessionReport {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut join_set: JoinSet<()> = JoinSet::new();

        for batch_pos in 0..self.batches.len() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(
                        claimed = batch_pos,
                        remaining = self.batches.len() - batch_pos,
                        "Cancellation received, no further batches will be claimed"
                    );
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Batch worker panicked");
                }
            }

            self.batches_claimed.store(batch_pos + 1, Ordering::SeqCst);
            self.active_workers.fetch_add(1, Ordering::SeqCst);
            self.publish_progress(SessionState::Running);

            let session = self.clone();
            join_set.spawn(async move {
                // Permit is held for the duration of this batch
                let _permit = permit;

                let counters = session.clone();
                let _guard = scopeguard::guard((), move |_| {
                    counters.active_workers.fetch_sub(1, Ordering::SeqCst);
                    counters.batches_done.fetch_add(1, Ordering::SeqCst);
                    counters.publish_progress(SessionState::Running);
                });

                session.process_batch(batch_pos).await;
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Batch worker panicked");
            }
        }

        self.finish()
    }

    /// Validate, send and merge one batch.
    #[tracing::instrument(skip(self), fields(session_id = %self.id))]
    async fn process_batch(&self, batch_pos: usize) {
        let batch = &self.batches[batch_pos];
        let kind_label = self.kind.to_string();

        let (valid, invalid): (Vec<ValidItem>, Vec<ValidItem>) = batch
            .items
            .iter()
            .enumerate()
            .map(|(offset, identifier)| ValidItem {
                index: batch.start + offset,
                identifier: identifier.clone(),
            })
            .partition(|item| self.rules.is_well_formed(&item.identifier, self.kind));

        if !invalid.is_empty() {
            let reason = FailureReason::InvalidFormat {
                reason: ValidationRules::rejection_reason(self.kind).to_string(),
            };
            let mut slots = self.slots.write();
            for item in &invalid {
                slots[item.index].settle(SlotState::Failed(reason.clone()));
            }
            drop(slots);
            self.record_items(&invalid);
            tracing::debug!(
                batch_index = batch.index,
                rejected = invalid.len(),
                "Rejected malformed identifiers"
            );
        }

        if valid.is_empty() {
            counter!("bulkcheck_batches_total", "kind" => kind_label, "outcome" => "skipped")
                .increment(1);
            tracing::debug!(
                batch_index = batch.index,
                "No valid identifiers in batch, skipping request"
            );
            return;
        }

        let token = self.tokens.for_batch(batch.index);
        let request = WebhookRequest {
            url: self.webhook_url.clone(),
            payload: WebhookPayload::new(
                token,
                valid.iter().map(|item| item.identifier.clone()).collect(),
            ),
        };

        tracing::debug!(
            batch_index = batch.index,
            start = batch.start,
            sent = valid.len(),
            "Dispatching batch"
        );

        let result = fetch_with_retry(
            &self.http_client,
            &request,
            &self.retry_policy,
            &self.connectivity,
            &self.cancel,
        )
        .await;

        let outcome = match result {
            Ok(response) if response.is_success() => {
                let mut slots = self.slots.write();
                let summary = merge_batch_response(
                    self.kind,
                    &response.body,
                    &valid,
                    &batch.items,
                    &mut slots,
                );
                drop(slots);
                self.record_items(&valid);
                tracing::info!(
                    batch_index = batch.index,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "Batch completed"
                );
                "succeeded"
            }
            Ok(response) => {
                tracing::warn!(
                    batch_index = batch.index,
                    status = response.status,
                    "Webhook rejected batch"
                );
                self.fail_all(&valid, FailureReason::HttpStatus {
                    status: response.status,
                });
                "http_error"
            }
            Err(BulkCheckError::Cancelled) => {
                tracing::debug!(batch_index = batch.index, "Batch aborted by cancellation");
                "cancelled"
            }
            Err(e) => {
                tracing::warn!(batch_index = batch.index, error = %e, "Batch failed");
                self.fail_all(&valid, failure_for_error(e));
                "failed"
            }
        };

        counter!("bulkcheck_batches_total", "kind" => kind_label, "outcome" => outcome)
            .increment(1);
    }

    fn fail_all(&self, items: &[ValidItem], reason: FailureReason) {
        let mut slots = self.slots.write();
        for item in items {
            slots[item.index].settle(SlotState::Failed(reason.clone()));
        }
        drop(slots);
        self.record_items(items);
    }

    /// Count each settled item under its outcome label.
    fn record_items(&self, items: &[ValidItem]) {
        let kind_label = self.kind.to_string();
        let slots = self.slots.read();
        for item in items {
            if let Some(label) = slots.get(item.index).and_then(outcome_label) {
                counter!("bulkcheck_items_total", "kind" => kind_label.clone(), "outcome" => label)
                    .increment(1);
            }
        }
    }

    fn publish_progress(&self, state: SessionState) {
        let mut progress = Progress::from_slots(&self.slots.read());
        progress.state = state;
        progress.batches_total = self.batches.len();
        progress.batches_claimed = self.batches_claimed.load(Ordering::SeqCst);
        progress.batches_done = self.batches_done.load(Ordering::SeqCst);
        progress.active_workers = self.active_workers.load(Ordering::SeqCst);
        self.progress_tx.send_replace(progress);
    }

    /// Settle the session once every worker has drained.
    fn finish(&self) -> SessionReport {
        // A cancel that arrives after every slot settled stopped nothing
        let stopped_work = self.slots.read().iter().any(ResultSlot::is_pending);
        let state = if self.cancel.is_cancelled() && stopped_work {
            SessionState::Cancelled
        } else {
            SessionState::Completed
        };

        if state == SessionState::Cancelled && self.cancel_policy == CancelPolicy::MarkCancelled {
            let mut slots = self.slots.write();
            let mut marked = 0usize;
            for slot in slots.iter_mut().filter(|slot| slot.is_pending()) {
                slot.settle(SlotState::Cancelled);
                marked += 1;
            }
            drop(slots);
            tracing::info!(marked, "Marked pending slots as cancelled");
        }

        self.publish_progress(state);
        let progress = self.progress_tx.borrow().clone();

        tracing::info!(
            ?state,
            succeeded = progress.succeeded,
            failed = progress.failed,
            cancelled = progress.cancelled,
            pending = progress.pending,
            "Bulk check finished"
        );

        SessionReport {
            session_id: self.id,
            kind: self.kind,
            state,
            settings: self.settings,
            progress,
            slots: self.slots.read().clone(),
        }
    }
}

/// Metrics label for a settled slot: `succeeded` or the failure's own label.
fn outcome_label(slot: &ResultSlot) -> Option<&'static str> {
    match &slot.state {
        SlotState::Succeeded(_) => Some("succeeded"),
        SlotState::Failed(reason) => Some(reason.label()),
        SlotState::Pending | SlotState::Cancelled => None,
    }
}

/// Map a terminal fetch error onto the reason recorded on each slot.
fn failure_for_error(error: BulkCheckError) -> FailureReason {
    match error {
        BulkCheckError::Timeout(_) => FailureReason::Timeout,
        BulkCheckError::Connection(error) => FailureReason::Connection { error },
        BulkCheckError::HttpClient(e) if e.is_timeout() => FailureReason::Timeout,
        BulkCheckError::HttpClient(e) if e.is_connect() => FailureReason::Connection {
            error: e.to_string(),
        },
        other => FailureReason::Network {
            error: other.to_string(),
        },
    }
}
