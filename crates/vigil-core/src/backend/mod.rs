//! OS watch backends: thin adapters over event-driven and poll-based
//! notification, plus the preferred-method fallback chain.
//!
//! Both backends deliver [`RawSignal`]s into the owning node's raw channel.
//! Raw signals are triggers for reconciliation, never trusted descriptions
//! of what changed.

pub(crate) mod event;
pub(crate) mod poll;

use crate::config::{WatchConfig, WatchMethod};
use crate::events::NodeEvent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// What a backend tells its node. Hints are for logging only.
#[derive(Debug, Clone)]
pub enum RawSignal {
    Notify {
        method: WatchMethod,
        hint: Option<String>,
    },
    /// Non-persistent poll backend observed the last subscriber leave.
    SubscribersGone,
}

/// Exclusive owner of one bound OS watching mechanism. Dropping it (or
/// calling [`BackendHandle::unbind`]) releases the OS resource.
pub(crate) enum BackendHandle {
    Event(event::EventHandle),
    Poll(poll::PollHandle),
}

impl BackendHandle {
    pub(crate) fn method(&self) -> WatchMethod {
        match self {
            BackendHandle::Event(_) => WatchMethod::Event,
            BackendHandle::Poll(_) => WatchMethod::Poll,
        }
    }

    pub(crate) fn unbind(self) {
        match self {
            BackendHandle::Event(h) => drop(h),
            BackendHandle::Poll(h) => h.stop(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BindError {
    #[error("event backend rejected {}: {source}", .path.display())]
    Event {
        path: PathBuf,
        #[source]
        source: Arc<notify::Error>,
    },
    #[error("poll backend rejected {}: {source}", .path.display())]
    Poll {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

/// Walk the preferred-method chain until one backend binds.
///
/// Returns the bound method and handle together with the failures that
/// preceded it; exhaustion returns every attempt's error.
pub(crate) async fn bind_with_fallback(
    path: &Path,
    cfg: &WatchConfig,
    raw_tx: &mpsc::UnboundedSender<RawSignal>,
    events: &broadcast::Sender<NodeEvent>,
) -> Result<(BackendHandle, Vec<(WatchMethod, BindError)>), Vec<(WatchMethod, BindError)>> {
    let mut failed = Vec::new();

    for method in &cfg.preferred_methods {
        let attempt = match method {
            WatchMethod::Event => event::bind(path, raw_tx.clone()).map(BackendHandle::Event),
            WatchMethod::Poll => poll::bind(path, cfg, raw_tx.clone(), events.clone())
                .await
                .map(BackendHandle::Poll),
        };

        match attempt {
            Ok(handle) => return Ok((handle, failed)),
            Err(e) => {
                debug!(path = %path.display(), %method, error = %e, "bind failed, trying next method");
                failed.push((*method, e));
            }
        }
    }

    Err(failed)
}
