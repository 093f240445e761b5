//! Process-wide registry: one node per absolute path.
//!
//! Lazily-initialised singleton behind a mutex with short critical
//! sections; callers never see it as mutable global state, only through
//! [`watch`]. Entries are inserted on construction and cleared when the
//! node closes.

use crate::config::WatchConfig;
use crate::node::{self, NodeHandle, WatchError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Default)]
struct Registry {
    nodes: HashMap<PathBuf, NodeHandle>,
    /// Canonical real path → owning node path. Guards against symlink
    /// aliases spawning duplicate subtrees (and against symlink cycles).
    canonical: HashMap<PathBuf, PathBuf>,
}

fn global() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

/// Watch a path, recursively.
///
/// The registry deduplicates: a second call for the same absolute path
/// updates the existing node's configuration and re-activates it (a no-op
/// when already active) instead of constructing a duplicate.
pub async fn watch(path: impl AsRef<Path>, cfg: WatchConfig) -> Result<NodeHandle, WatchError> {
    cfg.validate()?;
    let handle = obtain(path.as_ref(), &cfg).await?;
    handle.watch().await?;
    Ok(handle)
}

/// Get-or-create without activating; activation is the caller's move so it
/// can subscribe first.
pub(crate) async fn obtain(path: &Path, cfg: &WatchConfig) -> Result<NodeHandle, WatchError> {
    let abs = absolutize(path)?;
    let canonical = if cfg.follow_links {
        tokio::fs::canonicalize(&abs).await.ok()
    } else {
        None
    };

    let mut reg = global().lock().expect("watcher registry poisoned");

    if let Some(existing) = reg.nodes.get(&abs) {
        if !existing.state().is_terminal() {
            let existing = existing.clone();
            drop(reg);
            existing.update_config(cfg.clone());
            return Ok(existing);
        }
    }

    if let Some(canon) = &canonical {
        if canon.as_path() != abs.as_path() {
            if let Some(owner) = reg.canonical.get(canon) {
                let alive = reg
                    .nodes
                    .get(owner)
                    .map(|h| !h.state().is_terminal())
                    .unwrap_or(false);
                if owner.as_path() != abs.as_path() && alive {
                    return Err(WatchError::AliasedPath {
                        path: abs,
                        canonical: canon.clone(),
                    });
                }
            }
        }
    }

    let handle = node::spawn(abs.clone(), cfg.clone());
    reg.nodes.insert(abs.clone(), handle.clone());
    if let Some(canon) = canonical {
        reg.canonical.insert(canon, abs);
    }
    Ok(handle)
}

/// Called by a node as it reaches a terminal state.
pub(crate) fn remove(path: &Path) {
    let mut reg = match global().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    // Only clear the entry if it still refers to a terminal node; a fresh
    // node may already have replaced a closed one at the same path.
    let stale = reg
        .nodes
        .get(path)
        .map(|h| h.state().is_terminal())
        .unwrap_or(false);
    if stale {
        reg.nodes.remove(path);
    }

    let Registry { nodes, canonical } = &mut *reg;
    canonical.retain(|_, owner| nodes.contains_key(owner));
}

fn absolutize(path: &Path) -> Result<PathBuf, WatchError> {
    std::path::absolute(path).map_err(|e| WatchError::Stat {
        path: path.to_path_buf(),
        source: Arc::new(e),
    })
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CloseReason;

    #[tokio::test]
    async fn watch_rejects_empty_method_list() {
        let cfg = WatchConfig {
            preferred_methods: vec![],
            ..Default::default()
        };
        let err = watch("/tmp", cfg).await.unwrap_err();
        assert!(matches!(err, WatchError::EmptyMethods));
    }

    #[tokio::test]
    async fn closed_entries_are_cleared() {
        let dir = tempfile::TempDir::new().unwrap();
        let handle = watch(dir.path(), WatchConfig::default()).await.unwrap();
        let abs = absolutize(dir.path()).unwrap();

        assert!(global().lock().unwrap().nodes.contains_key(&abs));
        handle.close(CloseReason::Normal).await;
        assert!(!global().lock().unwrap().nodes.contains_key(&abs));
    }
}
