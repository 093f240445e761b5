//! Event backend: push notifications for a single path.
//!
//! One `notify` watcher per node, bound non-recursively. The OS callback runs
//! on notify's thread and only forwards into the node's raw channel; all
//! interpretation happens in the node's own task.

use super::{BindError, RawSignal};
use crate::config::WatchMethod;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Holds the OS registration; dropping it unbinds.
pub(crate) struct EventHandle {
    _watcher: RecommendedWatcher,
}

pub(crate) fn bind(
    path: &Path,
    raw_tx: mpsc::UnboundedSender<RawSignal>,
) -> Result<EventHandle, BindError> {
    let mut watcher = notify::recommended_watcher(
        move |res: Result<notify::Event, notify::Error>| {
            // Kind strings and attached names are hints only; even an error
            // from the OS is worth a reconciliation pass.
            let hint = match res {
                Ok(ev) => Some(format!("{:?}", ev.kind)),
                Err(e) => Some(format!("backend error: {e}")),
            };
            let _ = raw_tx.send(RawSignal::Notify {
                method: WatchMethod::Event,
                hint,
            });
        },
    )
    .map_err(|e| BindError::Event {
        path: path.to_path_buf(),
        source: Arc::new(e),
    })?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|e| BindError::Event {
            path: path.to_path_buf(),
            source: Arc::new(e),
        })?;

    Ok(EventHandle { _watcher: watcher })
}
