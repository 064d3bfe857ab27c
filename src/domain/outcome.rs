//! Normalised check outcomes built from webhook records.
//!
//! The webhook is loose about field names and presence. Each field is read
//! independently from a list of known aliases; anything absent falls back to
//! [`PLACEHOLDER`] so a partial record never breaks the merge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::validate::IdentifierKind;

/// Shown for any field the webhook did not provide.
pub const PLACEHOLDER: &str = "-";

/// Status used when the record carries none.
pub const UNKNOWN_STATUS: &str = "unknown";

const PHONE_ID_FIELDS: &[&str] = &["nomor", "number", "msisdn"];
const VOUCHER_ID_FIELDS: &[&str] = &["serialNumber", "serial_number", "serial"];
const STATUS_FIELDS: &[&str] = &["status", "myField"];
const GRACE_FIELDS: &[&str] = &["masaTenggang", "masa_tenggung", "grace_period_until"];
const EXPIRY_FIELDS: &[&str] = &["kadaluarsa", "terminated", "expires_at"];
const CALL_PLAN_FIELDS: &[&str] = &["callPlan", "call_plan"];
const PACKAGE_LIST_FIELDS: &[&str] = &["PackageInfo", "packages"];
const PACKAGE_NAME_FIELDS: &[&str] = &["description", "name"];
const PACKAGE_START_FIELDS: &[&str] = &["startDate", "aktif", "start"];
const PACKAGE_END_FIELDS: &[&str] = &["endDate", "berakir", "end"];
const PACKAGE_QUOTA_FIELDS: &[&str] = &["QuotaInfo", "quota"];

/// A data/voice package attached to a phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub start: String,
    pub end: String,
    pub quota: String,
}

/// Status of one phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneStatus {
    pub number: String,
    pub status: String,
    pub grace_period_until: String,
    pub expires_at: String,
    pub call_plan: String,
    pub packages: Vec<PackageInfo>,
}

/// Status of one voucher serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherStatus {
    pub serial_number: String,
    pub status: String,
    /// Every field the webhook returned besides the serial and status
    pub additional_info: Map<String, Value>,
}

/// Successful result for one identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CheckOutcome {
    Phone(PhoneStatus),
    Voucher(VoucherStatus),
}

impl CheckOutcome {
    pub fn status(&self) -> &str {
        match self {
            CheckOutcome::Phone(p) => &p.status,
            CheckOutcome::Voucher(v) => &v.status,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            CheckOutcome::Phone(p) => &p.number,
            CheckOutcome::Voucher(v) => &v.serial_number,
        }
    }

    /// Build an outcome from one webhook record.
    ///
    /// `fallback_identifier` is used when the record does not name its identifier.
    /// Non-object records (a bare string status, for instance) are accepted as a status.
    pub fn from_record(kind: IdentifierKind, record: &Value, fallback_identifier: &str) -> Self {
        let empty = Map::new();
        let (fields, bare_status) = match record {
            Value::Object(map) => (map, None),
            other => (&empty, scalar_to_string(other)),
        };

        let status = bare_status
            .or_else(|| first_string(fields, STATUS_FIELDS))
            .unwrap_or_else(|| UNKNOWN_STATUS.to_string());

        match kind {
            IdentifierKind::Phone => CheckOutcome::Phone(PhoneStatus {
                number: first_string(fields, PHONE_ID_FIELDS)
                    .unwrap_or_else(|| fallback_identifier.to_string()),
                status,
                grace_period_until: or_placeholder(first_string(fields, GRACE_FIELDS)),
                expires_at: or_placeholder(first_string(fields, EXPIRY_FIELDS)),
                call_plan: or_placeholder(first_string(fields, CALL_PLAN_FIELDS)),
                packages: packages(fields),
            }),
            IdentifierKind::Voucher => {
                let mut additional_info = fields.clone();
                for key in VOUCHER_ID_FIELDS.iter().chain(STATUS_FIELDS) {
                    additional_info.remove(*key);
                }
                CheckOutcome::Voucher(VoucherStatus {
                    serial_number: first_string(fields, VOUCHER_ID_FIELDS)
                        .unwrap_or_else(|| fallback_identifier.to_string()),
                    status,
                    additional_info,
                })
            }
        }
    }
}

/// The identifier a record names for itself, if any.
pub fn record_identifier(kind: IdentifierKind, record: &Value) -> Option<String> {
    let fields = record.as_object()?;
    match kind {
        IdentifierKind::Phone => first_string(fields, PHONE_ID_FIELDS),
        IdentifierKind::Voucher => first_string(fields, VOUCHER_ID_FIELDS),
    }
}

fn packages(fields: &Map<String, Value>) -> Vec<PackageInfo> {
    let Some(list) = PACKAGE_LIST_FIELDS
        .iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_array))
    else {
        return Vec::new();
    };

    list.iter()
        .filter_map(Value::as_object)
        .map(|pkg| PackageInfo {
            name: or_placeholder(first_string(pkg, PACKAGE_NAME_FIELDS)),
            start: or_placeholder(first_string(pkg, PACKAGE_START_FIELDS)),
            end: or_placeholder(first_string(pkg, PACKAGE_END_FIELDS)),
            quota: or_placeholder(first_string(pkg, PACKAGE_QUOTA_FIELDS)),
        })
        .collect()
}

fn first_string(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(scalar_to_string))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn or_placeholder(value: Option<String>) -> String {
    value.unwrap_or_else(|| PLACEHOLDER.to_string())
}
