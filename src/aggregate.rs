//! Merge a batch response back into index-addressed result slots.
//!
//! Accepted response shapes, tried in order:
//! 1. an object with a named record array (`SimInfo`)
//! 2. an object with a generic `results` array
//! 3. a bare top-level array
//! 4. any other value, taken as a single record
//!
//! Record `idx` belongs to the `idx`-th identifier actually sent. Every sent
//! identifier carries its own absolute index, so slots failed during validation
//! are never overwritten.

use serde::Serialize;
use serde_json::Value;

use crate::domain::{CheckOutcome, FailureReason, ResultSlot, SlotState};
use crate::domain::outcome::record_identifier;
use crate::validate::IdentifierKind;

const NAMED_RECORD_FIELDS: &[&str] = &["SimInfo", "results"];

/// An identifier that passed validation, with its absolute slot index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidItem {
    pub index: usize,
    pub identifier: String,
}

/// What a merge wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Records past the end of the sent sub-batch
    pub ignored: usize,
}

/// Pull the record list out of a response body.
pub fn extract_records(body: Value) -> Vec<Value> {
    match body {
        Value::Array(records) => records,
        Value::Object(mut map) => {
            for field in NAMED_RECORD_FIELDS {
                if matches!(map.get(*field), Some(Value::Array(_)))
                    && let Some(Value::Array(records)) = map.remove(*field)
                {
                    return records;
                }
            }
            vec![Value::Object(map)]
        }
        other => vec![other],
    }
}

/// `record.identifier ?? valid[idx] ?? original[idx]`.
pub fn resolve_identifier(
    kind: IdentifierKind,
    record: &Value,
    idx: usize,
    valid: &[ValidItem],
    original: &[String],
) -> Option<String> {
    record_identifier(kind, record)
        .or_else(|| valid.get(idx).map(|item| item.identifier.clone()))
        .or_else(|| original.get(idx).cloned())
}

/// Write the outcome of one successful batch call into `slots`.
///
/// `slots` is the whole session buffer. A body that is not JSON fails every
/// sent identifier; sent identifiers without a matching record fail with
/// [`FailureReason::MissingResult`].
pub fn merge_batch_response(
    kind: IdentifierKind,
    raw_body: &str,
    valid: &[ValidItem],
    original: &[String],
    slots: &mut [ResultSlot],
) -> MergeSummary {
    let mut summary = MergeSummary::default();

    let body: Value = match serde_json::from_str(raw_body) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(
                error = %e,
                body_len = raw_body.len(),
                "Webhook returned a non-JSON body"
            );
            let reason = FailureReason::MalformedResponse {
                error: e.to_string(),
            };
            for item in valid {
                if settle(slots, item.index, SlotState::Failed(reason.clone())) {
                    summary.failed += 1;
                }
            }
            return summary;
        }
    };

    let records = extract_records(body);

    for (idx, record) in records.iter().enumerate() {
        let Some(item) = valid.get(idx) else {
            summary.ignored += 1;
            continue;
        };
        let identifier = resolve_identifier(kind, record, idx, valid, original)
            .unwrap_or_else(|| item.identifier.clone());
        let outcome = CheckOutcome::from_record(kind, record, &identifier);
        if settle(slots, item.index, SlotState::Succeeded(outcome)) {
            summary.succeeded += 1;
        }
    }

    for item in valid.iter().skip(records.len()) {
        if settle(slots, item.index, SlotState::Failed(FailureReason::MissingResult)) {
            summary.failed += 1;
        }
    }

    if summary.ignored > 0 {
        tracing::warn!(
            extra_records = summary.ignored,
            sent = valid.len(),
            "Webhook returned more records than identifiers sent"
        );
    }

    summary
}

fn settle(slots: &mut [ResultSlot], index: usize, state: SlotState) -> bool {
    match slots.get_mut(index) {
        Some(slot) => slot.settle(state),
        None => {
            tracing::error!(index, len = slots.len(), "Slot index out of range");
            false
        }
    }
}
