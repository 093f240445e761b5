//! The three-phase reconciliation and recursive child management.
//!
//! A debounced batch runs existence check → change check → diff, in that
//! order. The diff fans out over children in parallel; the batch resolves
//! only after every fan-out arm completes.

use super::*;
use crate::ignore::is_ignored;
use crate::scan::{self, ScanEntry};
use crate::stat::FileKind;
use futures::future::join_all;

impl NodeTask {
    pub(super) async fn reconcile(&mut self) -> Result<(), WatchError> {
        if self.state != WatchState::Active {
            return Ok(());
        }

        // Phase A: existence.
        let cur = match stat::snapshot(&self.path, self.cfg.follow_links).await {
            Ok(s) => Some(s),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(stat_error(&self.path, e)),
        };
        let Some(cur) = cur else {
            // Disappearance is not an error.
            self.do_close(CloseReason::Deleted).await;
            return Ok(());
        };

        let previous = self.prev.replace(cur.clone());

        // Same path, different inode: the file was replaced underneath us.
        // Report delete + create and rebuild the backend binding.
        if let Some(prev) = &previous {
            if !prev.same_identity(&cur) {
                self.emit_change(ChangeKind::Delete, None, Some(prev.clone()));
                self.emit_change(ChangeKind::Create, Some(cur.clone()), None);
                return self.activate(true, cur.kind == FileKind::Dir).await;
            }
        }

        // Phase B: change check.
        if !stat::changed(previous.as_ref(), Some(&cur)) {
            return Ok(());
        }

        // Phase C: diff.
        if cur.kind != FileKind::Dir {
            self.emit_change(ChangeKind::Update, Some(cur), previous);
            return Ok(());
        }
        self.diff_directory().await
    }

    /// Reconcile a directory's children map against a fresh listing.
    ///
    /// Three arms run concurrently: forwarded re-checks of surviving
    /// children (event method only, to push unreliable notifications down
    /// the tree), deletion closes, and new-child spawns. New names are
    /// reserved before the first await so nothing can double-spawn them.
    async fn diff_directory(&mut self) -> Result<(), WatchError> {
        let listing = scan::list_dir(&self.path, self.cfg.follow_links, &self.cfg.ignore)
            .await
            .map_err(|e| scan_error(&self.path, e))?;

        // A child that closed itself may still occupy its slot while its
        // close notification sits in our inbox; purge now so a recreated
        // path at the same name is seen as new.
        self.children.retain(|_, slot| match slot {
            ChildSlot::Live(link) => !link.handle.state().is_terminal(),
            ChildSlot::Reserved => true,
        });

        let fresh: std::collections::HashSet<&OsStr> =
            listing.iter().map(|e| e.name.as_os_str()).collect();

        // Forwarded re-check.
        let mut nudges = Vec::new();
        if self.backend.as_ref().map(|b| b.method()) == Some(WatchMethod::Event) {
            for (name, slot) in &self.children {
                if let ChildSlot::Live(link) = slot {
                    if fresh.contains(name.as_os_str()) {
                        nudges.push(link.handle.nudge());
                    }
                }
            }
        }

        // Deletion scan.
        let gone: Vec<OsString> = self
            .children
            .keys()
            .filter(|name| !fresh.contains(name.as_os_str()))
            .cloned()
            .collect();
        let mut closing = Vec::new();
        for name in gone {
            if is_ignored(&self.path.join(&name), &self.cfg.ignore) {
                continue;
            }
            match self.children.remove(&name) {
                Some(ChildSlot::Live(link)) => closing.push(link),
                Some(ChildSlot::Reserved) => {
                    // Sentinel, not a watcher: nothing to close.
                    warn!(
                        path = %self.path.display(),
                        child = %name.to_string_lossy(),
                        "reserved child slot vanished before spawn finished",
                    );
                }
                None => {}
            }
        }

        // Creation scan: reserve every new name before any await.
        let new_entries: Vec<ScanEntry> = listing
            .into_iter()
            .filter(|e| !self.children.contains_key(&e.name))
            .collect();
        for entry in &new_entries {
            self.children.insert(entry.name.clone(), ChildSlot::Reserved);
        }

        let cfg = self.cfg.clone();
        let parent_tx = self.inbox_tx.clone();
        let spawned = {
            let nudge_arm = join_all(nudges);
            let close_arm = join_all(closing.into_iter().map(|link| async move {
                link.handle.close(CloseReason::Deleted).await;
                link.forwarder.abort();
            }));
            let spawn_arm = join_all(new_entries.iter().map(|entry| {
                let cfg = cfg.clone();
                let parent_tx = parent_tx.clone();
                async move { spawn_child(&entry.path, &entry.name, cfg, parent_tx, true).await }
            }));
            let (_, _, spawned) = tokio::join!(nudge_arm, close_arm, spawn_arm);
            spawned
        };

        for (entry, result) in new_entries.iter().zip(spawned) {
            self.finish_spawn(entry, result, true);
        }
        Ok(())
    }

    /// Enumerate and spawn the children of a freshly-activated directory.
    pub(super) async fn populate_children(&mut self, announce: bool) -> Result<(), WatchError> {
        let listing = scan::list_dir(&self.path, self.cfg.follow_links, &self.cfg.ignore)
            .await
            .map_err(|e| scan_error(&self.path, e))?;

        let new_entries: Vec<ScanEntry> = listing
            .into_iter()
            .filter(|e| !self.children.contains_key(&e.name))
            .collect();
        for entry in &new_entries {
            self.children.insert(entry.name.clone(), ChildSlot::Reserved);
        }

        let cfg = self.cfg.clone();
        let parent_tx = self.inbox_tx.clone();
        let spawned = join_all(new_entries.iter().map(|entry| {
            let cfg = cfg.clone();
            let parent_tx = parent_tx.clone();
            async move { spawn_child(&entry.path, &entry.name, cfg, parent_tx, announce).await }
        }))
        .await;

        let mut failed: Option<PathBuf> = None;
        for (entry, result) in new_entries.iter().zip(spawned) {
            if !self.finish_spawn(entry, result, announce) && failed.is_none() {
                failed = Some(entry.path.clone());
            }
        }

        match failed {
            Some(path) => Err(WatchError::ChildFailure { path }),
            None => Ok(()),
        }
    }

    /// Resolve one reserved slot. Returns false only on a real spawn
    /// failure (aliases count as skips, not failures).
    fn finish_spawn(
        &mut self,
        entry: &ScanEntry,
        result: Result<(NodeHandle, JoinHandle<()>), WatchError>,
        announce: bool,
    ) -> bool {
        match result {
            Ok((handle, forwarder)) => {
                self.children
                    .insert(entry.name.clone(), ChildSlot::Live(ChildLink { handle, forwarder }));
                if announce {
                    if let Some(stat) = entry.stat.clone() {
                        self.emit_change_at(ChangeKind::Create, entry.path.clone(), Some(stat), None);
                    }
                    // Entry without a snapshot vanished mid-spawn; its own
                    // node reconciles and reports the disappearance.
                }
                true
            }
            Err(WatchError::AliasedPath { canonical, .. }) => {
                self.children.remove(&entry.name);
                self.emit_log(
                    LogLevel::Warn,
                    format!(
                        "skipping {}: aliases already-watched {}",
                        entry.path.display(),
                        canonical.display()
                    ),
                );
                true
            }
            Err(e) => {
                self.children.remove(&entry.name);
                self.emit_log(
                    LogLevel::Warn,
                    format!("failed to watch child {}: {e}", entry.path.display()),
                );
                self.emit(NodeEvent::Error(e));
                false
            }
        }
    }
}

/// Obtain a node for a child path (inheriting the parent's configuration),
/// attach the bubble forwarder, then activate.
///
/// The forwarder is attached before activation so no event emitted by the
/// child after its `watching` can slip past the parent.
async fn spawn_child(
    path: &Path,
    name: &OsStr,
    cfg: WatchConfig,
    parent_tx: mpsc::UnboundedSender<Msg>,
    announce: bool,
) -> Result<(NodeHandle, JoinHandle<()>), WatchError> {
    let handle = registry::obtain(path, &cfg).await?;
    let forwarder = spawn_forwarder(name.to_os_string(), &handle, parent_tx);

    let res = if announce {
        handle.watch_announced().await
    } else {
        handle.watch().await
    };
    match res {
        Ok(()) => Ok((handle, forwarder)),
        Err(e) => {
            forwarder.abort();
            Err(e)
        }
    }
}

/// Child close clears the parent's entry through a message, never through a
/// back-pointer: the forwarder is the child's only line to its parent.
fn spawn_forwarder(
    name: OsString,
    child: &NodeHandle,
    parent_tx: mpsc::UnboundedSender<Msg>,
) -> JoinHandle<()> {
    let mut rx = child.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(NodeEvent::Change(event)) => {
                    if parent_tx
                        .send(Msg::ChildChange {
                            name: name.clone(),
                            event,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(NodeEvent::Close(reason)) => {
                    let _ = parent_tx.send(Msg::ChildClosed { name, reason });
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        child = %name.to_string_lossy(),
                        skipped,
                        "event forwarder lagged",
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = parent_tx.send(Msg::ChildClosed {
                        name,
                        reason: CloseReason::Normal,
                    });
                    break;
                }
            }
        }
    })
}

#[inline]
fn scan_error(path: &Path, e: io::Error) -> WatchError {
    WatchError::Scan {
        path: path.to_path_buf(),
        source: Arc::new(e),
    }
}
