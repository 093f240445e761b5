//! End-to-end watcher behaviour against a real filesystem.
//!
//! Short debounce windows keep these fast; assertions that something does
//! NOT happen use windows a few times longer than the debounce.

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use vigil_core::{
    watch, ChangeEvent, ChangeKind, CloseReason, NodeEvent, WatchConfig, WatchMethod, WatchState,
};

fn fast_cfg() -> WatchConfig {
    WatchConfig {
        interval: Duration::from_millis(60),
        catchup_delay: Duration::from_millis(120),
        ..Default::default()
    }
}

const EXPECT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(700);

/// Wait for the first change event matching `pred`, failing the test on
/// timeout. Non-change events are skipped.
async fn expect_change(
    rx: &mut broadcast::Receiver<NodeEvent>,
    pred: impl Fn(&ChangeEvent) -> bool,
) -> ChangeEvent {
    let deadline = tokio::time::Instant::now() + EXPECT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for change event");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(NodeEvent::Change(ev))) if pred(&ev) => return ev,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for change event"),
        }
    }
}

/// Collect every change event arriving within `window`.
async fn drain_changes(rx: &mut broadcast::Receiver<NodeEvent>, window: Duration) -> Vec<ChangeEvent> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = match deadline.checked_duration_since(tokio::time::Instant::now()) {
            Some(r) => r,
            None => return out,
        };
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(NodeEvent::Change(ev))) => out.push(ev),
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return out,
        }
    }
}

#[tokio::test]
async fn file_update_emits_exactly_one_update() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"0123456789").unwrap();

    let node = watch(&file, fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    std::fs::write(&file, b"01234567890123456789").unwrap();

    let ev = expect_change(&mut rx, |ev| ev.kind == ChangeKind::Update).await;
    assert_eq!(ev.path, file);
    assert_eq!(ev.current.as_ref().unwrap().size, 20);
    assert_eq!(ev.previous.as_ref().unwrap().size, 10);

    // one logical change, one reconciliation, one event
    let extra = drain_changes(&mut rx, QUIET).await;
    assert!(extra.is_empty(), "unexpected follow-up events: {extra:?}");

    node.close(CloseReason::Normal).await;
}

#[tokio::test]
async fn directory_child_create_then_delete() {
    let dir = TempDir::new().unwrap();
    let node = watch(dir.path(), fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    let child = dir.path().join("x");
    std::fs::write(&child, b"hello").unwrap();

    let created = expect_change(&mut rx, |ev| ev.kind == ChangeKind::Create).await;
    assert_eq!(created.path, child);
    assert!(created.current.is_some());
    assert!(created.previous.is_none());

    std::fs::remove_file(&child).unwrap();

    let deleted = expect_change(&mut rx, |ev| ev.kind == ChangeKind::Delete).await;
    assert_eq!(deleted.path, child);
    assert!(deleted.current.is_none());

    node.close(CloseReason::Normal).await;
}

#[tokio::test]
async fn recursive_create_reports_subdir_then_contents() {
    let dir = TempDir::new().unwrap();
    let node = watch(dir.path(), fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    let sub = dir.path().join("sub");
    let nested = sub.join("f");
    std::fs::create_dir(&sub).unwrap();
    std::fs::write(&nested, b"nested").unwrap();

    let first = expect_change(&mut rx, |ev| {
        ev.kind == ChangeKind::Create && (ev.path == sub || ev.path == nested)
    })
    .await;
    let second = expect_change(&mut rx, |ev| {
        ev.kind == ChangeKind::Create && (ev.path == sub || ev.path == nested) && ev.path != first.path
    })
    .await;

    assert_eq!(first.path, sub, "directory should be announced before its contents");
    assert_eq!(second.path, nested);

    // and the new subtree is live: a later write under sub/ still reports
    std::fs::write(&nested, b"nested again!").unwrap();
    let updated = expect_change(&mut rx, |ev| {
        ev.kind == ChangeKind::Update && ev.path == nested
    })
    .await;
    assert!(updated.current.is_some());

    node.close(CloseReason::Normal).await;
}

#[tokio::test]
async fn swap_file_save_never_ends_on_a_bare_delete() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, b"original").unwrap();

    let node = watch(&file, fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    // editor save pattern: write swap, park the original, move swap over
    let swap = dir.path().join(".f.swp");
    let backup = dir.path().join("f~");
    std::fs::write(&swap, b"edited contents").unwrap();
    std::fs::rename(&file, &backup).unwrap();
    std::fs::rename(&swap, &file).unwrap();

    let events = drain_changes(&mut rx, Duration::from_secs(2)).await;
    let for_file: Vec<&ChangeEvent> = events.iter().filter(|ev| ev.path == file).collect();

    assert!(!for_file.is_empty(), "swap-file save produced no events");
    assert!(for_file.len() <= 2, "too many events: {for_file:?}");
    match for_file.as_slice() {
        [single] => assert!(matches!(single.kind, ChangeKind::Update | ChangeKind::Create)),
        [first, second] => {
            assert_eq!(first.kind, ChangeKind::Delete);
            assert_eq!(second.kind, ChangeKind::Create);
        }
        _ => unreachable!(),
    }

    node.close(CloseReason::Normal).await;
}

#[tokio::test]
async fn concurrent_watch_calls_share_one_node() {
    let dir = TempDir::new().unwrap();
    let (a, b) = tokio::join!(watch(dir.path(), fast_cfg()), watch(dir.path(), fast_cfg()));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.method(), b.method());
    assert_eq!(a.state(), WatchState::Active);

    // closing through one handle closes the (single) node behind both
    a.close(CloseReason::Normal).await;
    assert_eq!(b.state(), WatchState::Closed);
}

#[tokio::test]
async fn rewatching_an_active_node_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let node = watch(dir.path(), fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    node.watch().await.unwrap();

    let mut watching = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
    while let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) {
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(NodeEvent::Watching(err))) => {
                assert!(err.is_none());
                watching += 1;
            }
            Ok(Ok(_)) | Ok(Err(_)) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(watching, 1, "idempotent watch must emit watching exactly once");

    assert_eq!(node.state(), WatchState::Active);
    node.close(CloseReason::Normal).await;
}

#[tokio::test]
async fn close_silences_the_whole_subtree() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let node = watch(dir.path(), fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    node.close(CloseReason::Normal).await;
    assert_eq!(node.state(), WatchState::Closed);

    // churn after close must stay invisible
    std::fs::write(dir.path().join("new-file"), b"x").unwrap();
    std::fs::write(dir.path().join("sub").join("deep"), b"y").unwrap();

    let events = drain_changes(&mut rx, QUIET).await;
    assert!(events.is_empty(), "events after close: {events:?}");

    // terminal states are sticky
    assert!(node.watch().await.is_err());
}

#[tokio::test]
async fn poll_method_delivers_updates() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("polled.txt");
    std::fs::write(&file, b"v1").unwrap();

    let cfg = WatchConfig {
        preferred_methods: vec![WatchMethod::Poll],
        ..fast_cfg()
    };
    let node = watch(&file, cfg).await.unwrap();
    assert_eq!(node.method(), Some(WatchMethod::Poll));

    let mut rx = node.subscribe();
    std::fs::write(&file, b"v2 with more bytes").unwrap();

    let ev = expect_change(&mut rx, |ev| ev.kind == ChangeKind::Update).await;
    assert_eq!(ev.path, file);

    node.close(CloseReason::Normal).await;
}

#[tokio::test]
async fn deleted_root_emits_delete_then_close() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("doomed");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("inner"), b"z").unwrap();

    let node = watch(&root, fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    std::fs::remove_dir_all(&root).unwrap();

    let mut saw_delete_for_root = false;
    let deadline = tokio::time::Instant::now() + EXPECT;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for close");
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(NodeEvent::Change(ev))) => {
                if ev.kind == ChangeKind::Delete && ev.path == root {
                    assert!(ev.previous.is_some());
                    saw_delete_for_root = true;
                }
            }
            Ok(Ok(NodeEvent::Close(reason))) => {
                assert_eq!(reason, CloseReason::Deleted);
                break;
            }
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("channel closed early"),
            Err(_) => panic!("timed out waiting for close"),
        }
    }

    assert!(saw_delete_for_root, "delete must precede close");
    assert_eq!(node.state(), WatchState::Deleted);
    assert!(node.watch().await.is_err());
}

#[tokio::test]
async fn ignored_children_stay_invisible() {
    let dir = TempDir::new().unwrap();
    let node = watch(dir.path(), fast_cfg()).await.unwrap();
    let mut rx = node.subscribe();

    std::fs::create_dir(dir.path().join(".git")).unwrap();
    std::fs::write(dir.path().join("kept.txt"), b"keep me").unwrap();

    let ev = expect_change(&mut rx, |ev| ev.kind == ChangeKind::Create).await;
    assert_eq!(ev.path, dir.path().join("kept.txt"));

    let rest = drain_changes(&mut rx, QUIET).await;
    assert!(
        rest.iter().all(|ev| !ev.path.ends_with(Path::new(".git"))),
        "ignored path leaked: {rest:?}"
    );

    node.close(CloseReason::Normal).await;
}
