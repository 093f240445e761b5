//! Watcher configuration.

use crate::ignore::IgnoreOptions;
use crate::node::WatchError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An OS notification mechanism a node can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMethod {
    /// Push notifications from the OS. Fast but unreliable: event kinds and
    /// attached names are hints only.
    Event,
    /// Periodic stat comparison. Reliable, slower, heavier with many files.
    Poll,
}

impl std::fmt::Display for WatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchMethod::Event => write!(f, "event"),
            WatchMethod::Poll => write!(f, "poll"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Poll period for the poll backend.
    pub interval: Duration,
    /// With the poll method, keep the node alive even when nobody is
    /// subscribed. When false, a poll node closes itself once its last
    /// subscriber is gone.
    pub persistent: bool,
    /// Debounce window: quiescence after the last raw notification before
    /// reconciliation runs.
    pub catchup_delay: Duration,
    /// Ordered fallback chain. Must not be empty.
    pub preferred_methods: Vec<WatchMethod>,
    /// Follow the final symlink when stat-ing watched paths.
    pub follow_links: bool,
    pub ignore: IgnoreOptions,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5007),
            persistent: true,
            catchup_delay: Duration::from_millis(2000),
            preferred_methods: vec![WatchMethod::Event, WatchMethod::Poll],
            follow_links: true,
            ignore: IgnoreOptions::default(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.preferred_methods.is_empty() {
            return Err(WatchError::EmptyMethods);
        }
        Ok(())
    }
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.interval, Duration::from_millis(5007));
        assert!(cfg.persistent);
        assert_eq!(cfg.catchup_delay, Duration::from_millis(2000));
        assert_eq!(
            cfg.preferred_methods,
            vec![WatchMethod::Event, WatchMethod::Poll]
        );
        assert!(cfg.follow_links);
    }

    #[test]
    fn empty_methods_rejected() {
        let cfg = WatchConfig {
            preferred_methods: vec![],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(WatchError::EmptyMethods)));
    }
}
