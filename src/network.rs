//! Coarse network-quality estimate and the throughput settings derived from it.
//!
//! This is a heuristic over reported connection metadata, not a bandwidth test.
//! It only tunes throughput; correctness never depends on it.

use serde::{Deserialize, Serialize};

use crate::connectivity::ConnectionInfo;

/// Connectivity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Fast,
    Slow,
    Offline,
}

/// Throughput parameters for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
}

impl DispatchSettings {
    pub const FAST: DispatchSettings = DispatchSettings {
        batch_size: 5,
        concurrency: 10,
        timeout_ms: 10_000,
        retry_delay_ms: 1_000,
        max_retries: 2,
    };

    pub const SLOW: DispatchSettings = DispatchSettings {
        batch_size: 3,
        concurrency: 3,
        timeout_ms: 30_000,
        retry_delay_ms: 2_000,
        max_retries: 3,
    };

    /// Settings for a quality class; `None` when offline.
    pub fn for_quality(quality: NetworkQuality) -> Option<Self> {
        match quality {
            NetworkQuality::Fast => Some(Self::FAST),
            NetworkQuality::Slow => Some(Self::SLOW),
            NetworkQuality::Offline => None,
        }
    }
}

const MOBILE_MARKERS: [&str; 4] = ["iphone", "ipad", "ipod", "android"];

/// Classify the connection.
///
/// Connection metadata wins when present: `4g` or more than 5 Mbit/s is fast,
/// anything else is slow. Without metadata, mobile user agents are assumed slow.
pub fn classify(info: &ConnectionInfo) -> NetworkQuality {
    if !info.online {
        return NetworkQuality::Offline;
    }

    if info.effective_type.is_some() || info.downlink_mbps.is_some() {
        let is_4g = info.effective_type.as_deref() == Some("4g");
        let downlink = info.downlink_mbps.unwrap_or(0.0);
        return if is_4g || downlink > 5.0 {
            NetworkQuality::Fast
        } else {
            NetworkQuality::Slow
        };
    }

    let is_mobile = info.user_agent.as_deref().is_some_and(|ua| {
        let ua = ua.to_ascii_lowercase();
        MOBILE_MARKERS.iter().any(|marker| ua.contains(marker))
    });
    if is_mobile {
        NetworkQuality::Slow
    } else {
        NetworkQuality::Fast
    }
}

/// Settings for the current connection, or `None` when offline.
pub fn current_settings(info: &ConnectionInfo) -> Option<DispatchSettings> {
    let quality = classify(info);
    tracing::debug!(?quality, "Classified network quality");
    DispatchSettings::for_quality(quality)
}
