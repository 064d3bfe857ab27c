//! Connectivity state shared between the host and the dispatcher.
//!
//! The host feeds online/offline transitions and connection metadata in;
//! fetches park on [`ConnectivityMonitor::wait_until_online`] while offline.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection metadata as reported by the host platform.
///
/// Every field except `online` is optional; platforms differ in what they expose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub online: bool,
    /// Effective connection type such as `"4g"`, `"3g"` or `"2g"`
    pub effective_type: Option<String>,
    /// Downlink estimate in Mbit/s
    pub downlink_mbps: Option<f64>,
    pub user_agent: Option<String>,
}

impl ConnectionInfo {
    /// Online with no further metadata.
    pub fn online() -> Self {
        Self {
            online: true,
            effective_type: None,
            downlink_mbps: None,
            user_agent: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            ..Self::online()
        }
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::online()
    }
}

/// Watchable connectivity state. Cheap to clone; clones observe the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectionInfo>,
}

impl ConnectivityMonitor {
    pub fn new(info: ConnectionInfo) -> Self {
        let (tx, _rx) = watch::channel(info);
        Self { tx }
    }

    /// Current snapshot.
    pub fn info(&self) -> ConnectionInfo {
        self.tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    /// Replace the connection metadata (including the online flag).
    pub fn update(&self, info: ConnectionInfo) {
        self.tx.send_replace(info);
    }

    /// Record an online/offline transition, keeping the other metadata.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|info| {
            if info.online == online {
                return false;
            }
            info.online = online;
            tracing::info!(online, "Connectivity changed");
            true
        });
    }

    /// Resolve immediately when online, otherwise on the next online transition.
    pub async fn wait_until_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|info| info.online).await;
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectionInfo::online())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_resolves_immediately_when_online() {
        let monitor = ConnectivityMonitor::default();
        tokio::time::timeout(Duration::from_millis(100), monitor.wait_until_online())
            .await
            .expect("should not block while online");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_online() {
        let monitor = ConnectivityMonitor::new(ConnectionInfo::offline());
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_until_online().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        monitor.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve after going online")
            .unwrap();
    }

    #[test]
    fn test_set_online_keeps_metadata() {
        let monitor = ConnectivityMonitor::new(ConnectionInfo {
            online: true,
            effective_type: Some("4g".to_string()),
            downlink_mbps: Some(12.0),
            user_agent: None,
        });
        monitor.set_online(false);
        let info = monitor.info();
        assert!(!info.online);
        assert_eq!(info.effective_type.as_deref(), Some("4g"));
    }
}
