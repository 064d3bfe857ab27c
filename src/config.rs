//! Dispatcher configuration.

use serde::{Deserialize, Serialize};

use crate::network::DispatchSettings;
use crate::retry::{ShouldRetryFn, default_should_retry_fn};
use crate::validate::{ValidationRules, VoucherRule};

/// What happens to slots still pending when a session is cancelled.
///
/// Applied uniformly to every such slot of a cancelled run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Write `Cancelled` into every slot that never reached a terminal state.
    #[default]
    MarkCancelled,
    /// Leave them `Pending`.
    Abandon,
}

/// Configuration for the dispatcher.
#[derive(Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Webhook that receives one POST per batch
    pub webhook_url: String,

    /// Client-side identifier rules
    pub validation: ValidationRules,

    /// Treatment of pending slots on cancellation
    pub cancel_policy: CancelPolicy,

    /// Upper bound on any single backoff sleep, jitter included
    pub max_backoff_ms: u64,

    /// Upper bound of the uniform random jitter added to each backoff
    pub jitter_ms: u64,

    /// Fixed throughput settings; when set the network-quality estimate is skipped
    pub settings_override: Option<DispatchSettings>,

    /// Also cap the worker count at the estimator's `concurrency` value.
    /// By default only the token pool size bounds it.
    pub cap_workers_to_network_concurrency: bool,

    /// Predicate deciding whether a response is retried.
    /// Defaults to 429, 503 and any 5xx.
    #[serde(skip, default = "default_should_retry_fn")]
    pub should_retry: ShouldRetryFn,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            webhook_url: "http://127.0.0.1:5678/webhook/check".to_string(),
            validation: ValidationRules::default(),
            cancel_policy: CancelPolicy::default(),
            max_backoff_ms: 10_000,
            jitter_ms: 1_000,
            settings_override: None,
            cap_workers_to_network_concurrency: false,
            should_retry: default_should_retry_fn(),
        }
    }
}

impl DispatcherConfig {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            ..Default::default()
        }
    }

    pub fn with_voucher_rule(mut self, rule: VoucherRule) -> Self {
        self.validation.voucher_rule = rule;
        self
    }

    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings_override = Some(settings);
        self
    }
}
