//! Typed event channel payloads.
//!
//! Event kinds are enumerated statically; there is no string-keyed dispatch.

use crate::node::WatchError;
use crate::stat::StatSnapshot;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// The stable `change` contract:
/// `(update, path, current, previous)`, `(create, path, current, None)`,
/// `(delete, path, None, previous)`.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub current: Option<StatSnapshot>,
    pub previous: Option<StatSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    /// The watched path disappeared; the node emits its delete event
    /// immediately before the close event.
    Deleted,
    Failure,
    ChildFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
}

/// Everything a node can emit on its event channel.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Activation finished; carries the activation error if it failed.
    Watching(Option<WatchError>),
    Change(ChangeEvent),
    Close(CloseReason),
    Log(LogLine),
    Error(WatchError),
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::{FileKind, StatSnapshot};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn change_event_serializes_with_lowercase_kind() {
        let ev = ChangeEvent {
            kind: ChangeKind::Create,
            path: "/tmp/x".into(),
            current: Some(StatSnapshot {
                kind: FileKind::File,
                size: 5,
                mtime: Some(UNIX_EPOCH + Duration::from_secs(1)),
                birthtime: None,
                ino: 7,
                mode: 0o644,
                atime: None,
                ctime: None,
            }),
            previous: None,
        };

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "create");
        assert_eq!(json["current"]["size"], 5);
        assert!(json["previous"].is_null());
    }

    #[test]
    fn close_reason_uses_snake_case() {
        let json = serde_json::to_value(CloseReason::ChildFailure).unwrap();
        assert_eq!(json, "child_failure");
    }
}
