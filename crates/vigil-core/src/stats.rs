//! Per-node counters (no printing, auditable).

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct WatchStats {
    pub(crate) raw_signals: AtomicU64,
    pub(crate) batches: AtomicU64,
    pub(crate) events_emitted: AtomicU64,
    pub(crate) bubbled: AtomicU64,
    pub(crate) bind_fallbacks: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WatchStatsSnapshot {
    /// Raw backend notifications received.
    pub raw_signals: u64,
    /// Debounced reconciliation passes run.
    pub batches: u64,
    /// Change events emitted by this node itself.
    pub events_emitted: u64,
    /// Child change events re-emitted on this node.
    pub bubbled: u64,
    /// Times a preferred method failed and the next one was tried.
    pub bind_fallbacks: u64,
}

impl WatchStats {
    pub(crate) fn snapshot(&self) -> WatchStatsSnapshot {
        WatchStatsSnapshot {
            raw_signals: self.raw_signals.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            bubbled: self.bubbled.load(Ordering::Relaxed),
            bind_fallbacks: self.bind_fallbacks.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn bump(field: &AtomicU64) {
        field.fetch_add(1, Ordering::Relaxed);
    }
}
