//! Client-side identifier checks and intake helpers.
//!
//! Everything here is pure: no I/O, no clocks. Identifiers rejected by these
//! rules are failed locally and never reach the webhook.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Prefixes accepted for phone identifiers unless the config overrides them.
pub const DEFAULT_PHONE_PREFIXES: [&str; 5] = ["0895", "0896", "0897", "0898", "0899"];

/// Which channel a check run belongs to. Each kind has its own session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Phone,
    Voucher,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifierKind::Phone => write!(f, "phone"),
            IdentifierKind::Voucher => write!(f, "voucher"),
        }
    }
}

/// Format rule applied to voucher serials.
///
/// Two rules exist in the field and they disagree; the deployment chooses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoucherRule {
    /// Any non-empty run of ASCII digits.
    #[default]
    DigitsOnly,
    /// Digits only, starting with `prefix`, at most `max_len` digits long.
    Prefixed { prefix: String, max_len: usize },
}

impl VoucherRule {
    /// The stricter rule used by older voucher channels: `350` prefix, 12 digits max.
    pub fn legacy() -> Self {
        VoucherRule::Prefixed {
            prefix: "350".to_string(),
            max_len: 12,
        }
    }

    fn accepts(&self, serial: &str) -> bool {
        if !is_all_digits(serial) {
            return false;
        }
        match self {
            VoucherRule::DigitsOnly => true,
            VoucherRule::Prefixed { prefix, max_len } => {
                serial.starts_with(prefix.as_str()) && serial.len() <= *max_len
            }
        }
    }
}

/// The rule set a dispatcher validates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRules {
    pub phone_prefixes: Vec<String>,
    pub voucher_rule: VoucherRule,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            phone_prefixes: DEFAULT_PHONE_PREFIXES.iter().map(|p| p.to_string()).collect(),
            voucher_rule: VoucherRule::default(),
        }
    }
}

impl ValidationRules {
    /// Whether `identifier` may be sent to the webhook as a `kind` check.
    pub fn is_well_formed(&self, identifier: &str, kind: IdentifierKind) -> bool {
        let identifier = identifier.trim();
        match kind {
            IdentifierKind::Phone => self
                .phone_prefixes
                .iter()
                .any(|prefix| identifier.starts_with(prefix.as_str())),
            IdentifierKind::Voucher => self.voucher_rule.accepts(identifier),
        }
    }

    /// Short reason shown on a slot that failed validation.
    pub fn rejection_reason(kind: IdentifierKind) -> &'static str {
        match kind {
            IdentifierKind::Phone => "invalid prefix",
            IdentifierKind::Voucher => "invalid serial",
        }
    }
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Collapse duplicates while keeping first-seen order. Blank entries are dropped
/// and surrounding whitespace is trimmed.
pub fn dedup_identifiers<I, S>(identifiers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    identifiers
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

/// Split pasted text into identifiers, one per line.
pub fn normalize_identifiers(raw: &str) -> Vec<String> {
    dedup_identifiers(raw.lines())
}

/// Every serial from `start` to `end` inclusive.
///
/// Returns an empty list if either bound is not a number or `start > end`.
pub fn generate_sequential_serials(start: &str, end: &str) -> Vec<String> {
    let (Ok(start), Ok(end)) = (start.trim().parse::<u64>(), end.trim().parse::<u64>()) else {
        return Vec::new();
    };
    if start > end {
        return Vec::new();
    }
    (start..=end).map(|n| n.to_string()).collect()
}
