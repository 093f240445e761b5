//! Poll backend: periodic stat comparison for a single path.
//!
//! A tokio task ticks at the configured interval, snapshots the path, and
//! signals the node on any comparator delta or existence flip. Stopped
//! through a cancellation token.

use super::{BindError, RawSignal};
use crate::config::{WatchConfig, WatchMethod};
use crate::events::NodeEvent;
use crate::stat::{self, changed, StatSnapshot};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

pub(crate) struct PollHandle {
    cancel: CancellationToken,
}

impl PollHandle {
    pub(crate) fn stop(self) {
        self.cancel.cancel();
    }
}

/// Bind fails when the path cannot be stat-ed at all; after that, stat
/// failures during ticks are treated as "absent" and left for the node's
/// reconciliation to interpret.
pub(crate) async fn bind(
    path: &Path,
    cfg: &WatchConfig,
    raw_tx: mpsc::UnboundedSender<RawSignal>,
    events: broadcast::Sender<NodeEvent>,
) -> Result<PollHandle, BindError> {
    let initial = stat::snapshot(path, cfg.follow_links)
        .await
        .map_err(|e| BindError::Poll {
            path: path.to_path_buf(),
            source: Arc::new(e),
        })?;

    let cancel = CancellationToken::new();
    tokio::spawn(run_poll(
        path.to_path_buf(),
        cfg.interval,
        cfg.follow_links,
        cfg.persistent,
        Some(initial),
        raw_tx,
        events,
        cancel.clone(),
    ));

    Ok(PollHandle { cancel })
}

#[allow(clippy::too_many_arguments)]
async fn run_poll(
    path: std::path::PathBuf,
    interval: Duration,
    follow_links: bool,
    persistent: bool,
    mut last: Option<StatSnapshot>,
    raw_tx: mpsc::UnboundedSender<RawSignal>,
    events: broadcast::Sender<NodeEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately once; consume it so the first comparison
    // happens a full period after bind.
    ticker.tick().await;

    // Auto-close only after a subscriber has actually been seen, so a node
    // is not torn down before its creator had a chance to subscribe.
    let mut saw_subscriber = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !persistent {
                    let n = events.receiver_count();
                    if n > 0 {
                        saw_subscriber = true;
                    } else if saw_subscriber {
                        let _ = raw_tx.send(RawSignal::SubscribersGone);
                        break;
                    }
                }

                let cur = match stat::snapshot(&path, follow_links).await {
                    Ok(s) => Some(s),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                    // Transient stat failure: skip this tick, keep `last`.
                    Err(_) => continue,
                };

                if changed(last.as_ref(), cur.as_ref()) {
                    last = cur;
                    if raw_tx
                        .send(RawSignal::Notify { method: WatchMethod::Poll, hint: None })
                        .is_err()
                    {
                        // node gone
                        break;
                    }
                } else {
                    last = cur;
                }
            }
        }
    }
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn bind_rejects_missing_path() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("missing");
        let (raw_tx, _raw_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let cfg = WatchConfig::default();
        assert!(bind(&gone, &cfg, raw_tx, events).await.is_err());
    }

    #[tokio::test]
    async fn poll_signals_on_content_change() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"one").unwrap();

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (events, _keep) = broadcast::channel(16);
        let cfg = WatchConfig {
            interval: Duration::from_millis(50),
            ..Default::default()
        };

        let handle = bind(&file, &cfg, raw_tx, events).await.unwrap();
        std::fs::write(&file, b"one and then some").unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(5), raw_rx.recv())
            .await
            .expect("poll backend never signalled")
            .expect("raw channel closed");
        assert!(matches!(
            signal,
            RawSignal::Notify { method: WatchMethod::Poll, .. }
        ));

        handle.stop();
    }
}
