//! The per-path watcher node.
//!
//! DOES:
//! - Owns one path's watch state: snapshot, backend, children, pending batch.
//! - Runs the debounce protocol and the three-phase reconciliation.
//! - Emits typed events (change/watching/close/log/error) on a broadcast
//!   channel and bubbles child change events to its own channel.
//!
//! DOES NOT:
//! - Decide what is ignored (ignore.rs) or how directories are listed
//!   (scan.rs).
//! - Talk to the OS directly (backend/).
//! - Deduplicate nodes across the process (registry.rs).
//!
//! # Threading Design
//!
//! Every node's state is exclusively owned by its own tokio task. Backends,
//! timers, children and callers deliver messages into the node's unbounded
//! inbox; the task processes them strictly serially. That serialisation is
//! the invariant that makes children-map reconciliation safe without locks:
//! no two awaits inside one message handler can interleave with another
//! handler of the same node.

mod reconcile;

use crate::backend::{self, BackendHandle, RawSignal};
use crate::config::{WatchConfig, WatchMethod};
use crate::events::{ChangeEvent, ChangeKind, CloseReason, LogLevel, LogLine, NodeEvent};
use crate::registry;
use crate::stat::{self, StatSnapshot};
use crate::stats::{WatchStats, WatchStatsSnapshot};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------- States ----------------------------

/// Monotone lifecycle: `Pending → Active → (Closed | Deleted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Pending,
    Active,
    Closed,
    Deleted,
}

impl WatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WatchState::Closed | WatchState::Deleted)
    }

    fn as_u8(self) -> u8 {
        match self {
            WatchState::Pending => 0,
            WatchState::Active => 1,
            WatchState::Closed => 2,
            WatchState::Deleted => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => WatchState::Pending,
            1 => WatchState::Active,
            2 => WatchState::Closed,
            _ => WatchState::Deleted,
        }
    }
}

/// Lock-free mirror of the task-owned state, for handle queries.
pub(crate) struct Shared {
    state: AtomicU8,
    // 0 = none, 1 = event, 2 = poll
    method: AtomicU8,
    pub(crate) stats: WatchStats,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WatchState::Pending.as_u8()),
            method: AtomicU8::new(0),
            stats: WatchStats::default(),
        }
    }

    fn set_state(&self, s: WatchState) {
        self.state.store(s.as_u8(), Ordering::Release);
    }

    fn set_method(&self, m: Option<WatchMethod>) {
        let v = match m {
            None => 0,
            Some(WatchMethod::Event) => 1,
            Some(WatchMethod::Poll) => 2,
        };
        self.method.store(v, Ordering::Release);
    }
}

// ---------------------------- Messages ----------------------------

pub(crate) enum Msg {
    Watch {
        reset: bool,
        /// Emit create events for children discovered during this
        /// activation (set when the node itself just appeared).
        announce: bool,
        ack: Option<oneshot::Sender<Result<(), WatchError>>>,
    },
    Close {
        reason: CloseReason,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Forwarded re-check: join (or open) the pending batch and complete
    /// when it resolves.
    Nudge {
        ack: Option<oneshot::Sender<Result<(), WatchError>>>,
    },
    UpdateConfig(Box<WatchConfig>),
    ChildChange {
        name: OsString,
        event: ChangeEvent,
    },
    ChildClosed {
        name: OsString,
        reason: CloseReason,
    },
}

// ---------------------------- Handle ----------------------------

/// Cheap cloneable reference to a node. All mutation goes through the
/// node's task; the handle only sends messages and reads mirrors.
#[derive(Clone)]
pub struct NodeHandle {
    path: Arc<PathBuf>,
    tx: mpsc::UnboundedSender<Msg>,
    events: broadcast::Sender<NodeEvent>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

impl NodeHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to the node's event channel. Slow consumers may lag and
    /// lose intermediate events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> WatchState {
        WatchState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn method(&self) -> Option<WatchMethod> {
        match self.shared.method.load(Ordering::Acquire) {
            1 => Some(WatchMethod::Event),
            2 => Some(WatchMethod::Poll),
            _ => None,
        }
    }

    pub fn stats(&self) -> WatchStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Idempotent activation. Completes once the backend is bound and (for
    /// directories) children are enumerated; on an already-active node this
    /// is a no-op that still completes with `Ok`.
    pub async fn watch(&self) -> Result<(), WatchError> {
        self.watch_inner(false, false).await
    }

    pub(crate) async fn watch_announced(&self) -> Result<(), WatchError> {
        self.watch_inner(false, true).await
    }

    async fn watch_inner(&self, reset: bool, announce: bool) -> Result<(), WatchError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Msg::Watch {
                reset,
                announce,
                ack: Some(ack),
            })
            .map_err(|_| WatchError::Closed)?;
        rx.await.map_err(|_| WatchError::Closed)?
    }

    /// Close the node and its whole subtree. Idempotent; completes after the
    /// close event has been emitted.
    pub async fn close(&self, reason: CloseReason) {
        let (ack, rx) = oneshot::channel();
        if self
            .tx
            .send(Msg::Close {
                reason,
                ack: Some(ack),
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub(crate) fn update_config(&self, cfg: WatchConfig) {
        let _ = self.tx.send(Msg::UpdateConfig(Box::new(cfg)));
    }

    /// Future resolving when the node's next reconciliation pass completes.
    /// Resolves immediately for nodes that are already gone.
    pub(crate) fn nudge(&self) -> impl Future<Output = ()> + Send + 'static {
        let (ack, rx) = oneshot::channel();
        let sent = self.tx.send(Msg::Nudge { ack: Some(ack) }).is_ok();
        async move {
            if sent {
                let _ = rx.await;
            }
        }
    }
}

// ---------------------------- Task state ----------------------------

pub(crate) enum ChildSlot {
    /// Spawn in progress; the slot is claimed so a concurrent scan cannot
    /// double-spawn the same name.
    Reserved,
    Live(ChildLink),
}

pub(crate) struct ChildLink {
    pub(crate) handle: NodeHandle,
    pub(crate) forwarder: JoinHandle<()>,
}

struct PendingBatch {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<Result<(), WatchError>>>,
}

pub(crate) struct NodeTask {
    path: Arc<PathBuf>,
    cfg: WatchConfig,
    state: WatchState,
    prev: Option<StatSnapshot>,
    backend: Option<BackendHandle>,
    children: HashMap<OsString, ChildSlot>,
    pending: Option<PendingBatch>,
    events: broadcast::Sender<NodeEvent>,
    inbox_tx: mpsc::UnboundedSender<Msg>,
    raw_tx: mpsc::UnboundedSender<RawSignal>,
    shared: Arc<Shared>,
}

/// Construct a node in `Pending` state and start its task.
pub(crate) fn spawn(path: PathBuf, cfg: WatchConfig) -> NodeHandle {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let shared = Arc::new(Shared::new());
    let path = Arc::new(path);

    let task = NodeTask {
        path: Arc::clone(&path),
        cfg,
        state: WatchState::Pending,
        prev: None,
        backend: None,
        children: HashMap::new(),
        pending: None,
        events: events.clone(),
        inbox_tx: inbox_tx.clone(),
        raw_tx,
        shared: Arc::clone(&shared),
    };

    tokio::spawn(task.run(inbox_rx, raw_rx));

    NodeHandle {
        path,
        tx: inbox_tx,
        events,
        shared,
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl NodeTask {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Msg>,
        mut raw: mpsc::UnboundedReceiver<RawSignal>,
    ) {
        loop {
            let deadline = self.pending.as_ref().map(|b| b.deadline);

            tokio::select! {
                maybe = inbox.recv() => match maybe {
                    Some(msg) => self.handle(msg).await,
                    // Handles can only disappear after registry removal,
                    // i.e. after close; treat as a plain shutdown.
                    None => self.do_close(CloseReason::Normal).await,
                },
                maybe = raw.recv() => {
                    if let Some(signal) = maybe {
                        self.on_raw(signal).await;
                    }
                },
                _ = maybe_sleep(deadline) => self.run_batch().await,
            }

            if self.state.is_terminal() {
                break;
            }
        }
    }

    async fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Watch {
                reset,
                announce,
                ack,
            } => {
                let res = self.activate(reset, announce).await;
                if let Some(ack) = ack {
                    let _ = ack.send(res);
                }
            }
            Msg::Close { reason, ack } => {
                self.do_close(reason).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Msg::Nudge { ack } => {
                if self.state == WatchState::Active {
                    self.touch_batch(ack);
                } else if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Msg::UpdateConfig(cfg) => {
                self.cfg = *cfg;
            }
            Msg::ChildChange { name, event } => self.on_child_change(name, event).await,
            Msg::ChildClosed { name, reason } => {
                if self.children.remove(&name).is_some() {
                    debug!(
                        path = %self.path.display(),
                        child = %name.to_string_lossy(),
                        ?reason,
                        "child entry cleared",
                    );
                }
            }
        }
    }

    // ---------------------------- Debounce ----------------------------

    async fn on_raw(&mut self, signal: RawSignal) {
        match signal {
            RawSignal::SubscribersGone => {
                if !self.cfg.persistent {
                    self.emit_log(LogLevel::Info, "last subscriber gone, closing".into());
                    self.do_close(CloseReason::Normal).await;
                }
            }
            RawSignal::Notify { method, hint } => {
                WatchStats::bump(&self.shared.stats.raw_signals);
                debug!(
                    path = %self.path.display(),
                    %method,
                    hint = hint.as_deref().unwrap_or("-"),
                    "raw notification",
                );
                if self.state == WatchState::Active {
                    self.touch_batch(None);
                }
            }
        }
    }

    /// One pending batch per node: a raw signal while a batch is pending
    /// pushes the deadline out; otherwise a new batch opens.
    fn touch_batch(&mut self, waiter: Option<oneshot::Sender<Result<(), WatchError>>>) {
        let deadline = Instant::now() + self.cfg.catchup_delay;
        match &mut self.pending {
            Some(batch) => {
                batch.deadline = deadline;
                if let Some(w) = waiter {
                    batch.waiters.push(w);
                }
            }
            None => {
                self.pending = Some(PendingBatch {
                    deadline,
                    waiters: waiter.into_iter().collect(),
                });
            }
        }
    }

    async fn run_batch(&mut self) {
        let Some(batch) = self.pending.take() else {
            return;
        };
        WatchStats::bump(&self.shared.stats.batches);

        let result = self.reconcile().await;
        if let Err(e) = &result {
            self.emit(NodeEvent::Error(e.clone()));
        }
        for waiter in batch.waiters {
            let _ = waiter.send(result.clone());
        }
    }

    // ---------------------------- Activation ----------------------------

    /// `watch()` entry point: activate, emit `watching`, close on failure.
    async fn activate(&mut self, reset: bool, announce: bool) -> Result<(), WatchError> {
        if self.state.is_terminal() {
            return Err(WatchError::Closed);
        }
        if self.state == WatchState::Active && !reset {
            self.emit(NodeEvent::Watching(None));
            return Ok(());
        }

        let res = self.do_watch(reset, announce).await;
        match &res {
            Ok(()) => self.emit(NodeEvent::Watching(None)),
            Err(e) => {
                self.emit(NodeEvent::Error(e.clone()));
                self.emit(NodeEvent::Watching(Some(e.clone())));
                let reason = match e {
                    WatchError::ChildFailure { .. } => CloseReason::ChildFailure,
                    _ => CloseReason::Failure,
                };
                self.do_close(reason).await;
            }
        }
        res
    }

    async fn do_watch(&mut self, reset: bool, announce: bool) -> Result<(), WatchError> {
        if let Some(handle) = self.backend.take() {
            handle.unbind();
            self.shared.set_method(None);
        }

        let cur = stat::snapshot(&self.path, self.cfg.follow_links)
            .await
            .map_err(|e| stat_error(&self.path, e))?;
        self.prev = Some(cur.clone());

        let (handle, failed) =
            backend::bind_with_fallback(&self.path, &self.cfg, &self.raw_tx, &self.events)
                .await
                .map_err(|attempts| WatchError::BindExhausted {
                    path: self.path.as_ref().clone(),
                    attempts,
                })?;

        for (method, err) in &failed {
            WatchStats::bump(&self.shared.stats.bind_fallbacks);
            self.emit_log(
                LogLevel::Warn,
                format!("method {method} failed ({err}), fell back"),
            );
        }

        let method = handle.method();
        self.backend = Some(handle);
        self.shared.set_method(Some(method));

        if cur.kind == crate::stat::FileKind::Dir {
            if reset {
                self.close_children(CloseReason::Normal).await;
            }
            self.populate_children(announce).await?;
        }

        self.state = WatchState::Active;
        self.shared.set_state(self.state);
        self.emit_log(LogLevel::Info, format!("watching via {method}"));
        Ok(())
    }

    // ---------------------------- Close ----------------------------

    async fn do_close(&mut self, reason: CloseReason) {
        if self.state.is_terminal() {
            return;
        }

        if let Some(batch) = self.pending.take() {
            for waiter in batch.waiters {
                let _ = waiter.send(Ok(()));
            }
        }

        // Children go first so their entries are cleared before this node
        // reports anything further.
        let child_reason = match reason {
            CloseReason::Deleted => CloseReason::Deleted,
            _ => CloseReason::Normal,
        };
        self.close_children(child_reason).await;

        if let Some(handle) = self.backend.take() {
            handle.unbind();
        }
        self.shared.set_method(None);

        if reason == CloseReason::Deleted {
            let previous = self.prev.take();
            self.emit_change(ChangeKind::Delete, None, previous);
        }

        self.emit(NodeEvent::Close(reason));
        self.state = match reason {
            CloseReason::Deleted => WatchState::Deleted,
            _ => WatchState::Closed,
        };
        self.shared.set_state(self.state);
        registry::remove(&self.path);
    }

    async fn close_children(&mut self, reason: CloseReason) {
        let links: Vec<ChildLink> = self
            .children
            .drain()
            .filter_map(|(name, slot)| match slot {
                ChildSlot::Live(link) => Some(link),
                ChildSlot::Reserved => {
                    // The sentinel is a claim, not a watcher; there is
                    // nothing to close, only the claim to drop.
                    warn!(
                        path = %self.path.display(),
                        child = %name.to_string_lossy(),
                        "dropping reserved child slot on close",
                    );
                    None
                }
            })
            .collect();

        futures::future::join_all(links.into_iter().map(|link| async move {
            link.handle.close(reason).await;
            link.forwarder.abort();
        }))
        .await;
    }

    // ---------------------------- Bubbling ----------------------------

    async fn on_child_change(&mut self, name: OsString, event: ChangeEvent) {
        if self.state.is_terminal() {
            return;
        }

        WatchStats::bump(&self.shared.stats.bubbled);
        self.emit(NodeEvent::Change(event.clone()));

        // A delete naming the child itself: clean up proactively even if the
        // child's own close-notification loses the race.
        if event.kind == ChangeKind::Delete && event.path == self.path.join(&name) {
            self.close_child(&name, CloseReason::Deleted).await;
        }
    }

    pub(crate) async fn close_child(&mut self, name: &OsStr, reason: CloseReason) {
        match self.children.remove(name) {
            None => {}
            Some(ChildSlot::Reserved) => {
                // Explicitly handle the sentinel: a spawn is in flight and
                // there is no handle to close yet.
                warn!(
                    path = %self.path.display(),
                    child = %name.to_string_lossy(),
                    "close requested for reserved child slot",
                );
            }
            Some(ChildSlot::Live(link)) => {
                link.handle.close(reason).await;
                link.forwarder.abort();
            }
        }
    }

    // ---------------------------- Emission ----------------------------

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine; events may still bubble via parents.
        let _ = self.events.send(event);
    }

    fn emit_change(
        &self,
        kind: ChangeKind,
        current: Option<StatSnapshot>,
        previous: Option<StatSnapshot>,
    ) {
        self.emit_change_at(kind, self.path.as_ref().clone(), current, previous);
    }

    fn emit_change_at(
        &self,
        kind: ChangeKind,
        path: PathBuf,
        current: Option<StatSnapshot>,
        previous: Option<StatSnapshot>,
    ) {
        WatchStats::bump(&self.shared.stats.events_emitted);
        debug!(path = %path.display(), %kind, "change");
        self.emit(NodeEvent::Change(ChangeEvent {
            kind,
            path,
            current,
            previous,
        }));
    }

    fn emit_log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => debug!(path = %self.path.display(), "{message}"),
            LogLevel::Info => tracing::info!(path = %self.path.display(), "{message}"),
            LogLevel::Warn => warn!(path = %self.path.display(), "{message}"),
            LogLevel::Error => tracing::error!(path = %self.path.display(), "{message}"),
        }
        self.emit(NodeEvent::Log(LogLine { level, message }));
    }
}

#[inline]
fn stat_error(path: &Path, e: io::Error) -> WatchError {
    WatchError::Stat {
        path: path.to_path_buf(),
        source: Arc::new(e),
    }
}

// ---------------------------- Errors ----------------------------

#[derive(Debug, Clone, Error)]
pub enum WatchError {
    #[error("every preferred method failed binding {} ({} attempted)", .path.display(), .attempts.len())]
    BindExhausted {
        path: PathBuf,
        attempts: Vec<(WatchMethod, crate::backend::BindError)>,
    },

    #[error("stat failed for {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("directory scan failed for {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("child watcher failed for {}", .path.display())]
    ChildFailure { path: PathBuf },

    #[error("watcher is closed")]
    Closed,

    #[error("preferred_methods must not be empty")]
    EmptyMethods,

    #[error("{} aliases already-watched {}", .path.display(), .canonical.display())]
    AliasedPath { path: PathBuf, canonical: PathBuf },
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_terminal_only_at_the_end() {
        assert!(!WatchState::Pending.is_terminal());
        assert!(!WatchState::Active.is_terminal());
        assert!(WatchState::Closed.is_terminal());
        assert!(WatchState::Deleted.is_terminal());
    }

    #[test]
    fn state_u8_roundtrip() {
        for s in [
            WatchState::Pending,
            WatchState::Active,
            WatchState::Closed,
            WatchState::Deleted,
        ] {
            assert_eq!(WatchState::from_u8(s.as_u8()), s);
        }
    }

    #[tokio::test]
    async fn watch_on_missing_path_fails_and_closes() {
        let dir = tempfile::TempDir::new().unwrap();
        let gone = dir.path().join("missing");
        let handle = spawn(gone, WatchConfig::default());

        let err = handle.watch().await.unwrap_err();
        assert!(matches!(err, WatchError::Stat { .. }));
        assert_eq!(handle.state(), WatchState::Closed);

        // terminal states are sticky
        assert!(handle.watch().await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = spawn(dir.path().to_path_buf(), WatchConfig::default());
        handle.watch().await.unwrap();

        handle.close(CloseReason::Normal).await;
        assert_eq!(handle.state(), WatchState::Closed);
        handle.close(CloseReason::Normal).await;
        assert_eq!(handle.state(), WatchState::Closed);
    }
}
