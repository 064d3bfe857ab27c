//! Core domain types for bulk checks.
//!
//! - Result slots and their terminal states
//! - Normalised outcome records

pub mod outcome;
pub mod slot;

pub use outcome::{CheckOutcome, PackageInfo, PhoneStatus, VoucherStatus};
pub use slot::{FailureReason, ResultSlot, SlotState};
