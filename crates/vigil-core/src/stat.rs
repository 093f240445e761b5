//! Stat snapshots and the change comparator.
//!
//! A [`StatSnapshot`] is an immutable record of a path's metadata at one
//! instant. [`changed`] decides whether two snapshots represent a meaningful
//! change: `atime` and `ctime` are carried for inspection but excluded from
//! the comparison, since access/change-time jitter is pervasive and not a
//! semantic content change.

use serde::Serialize;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Metadata snapshot of a single path.
///
/// `mtime` keeps nanosecond resolution where the platform provides it.
/// `birthtime` is `None` on filesystems that do not record creation time;
/// callers fall back to inode identity for the "replaced file" test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatSnapshot {
    pub kind: FileKind,
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub birthtime: Option<SystemTime>,
    pub ino: u64,
    pub mode: u32,
    /// Excluded from [`changed`].
    pub atime: Option<SystemTime>,
    /// Excluded from [`changed`].
    pub ctime: Option<SystemTime>,
}

impl StatSnapshot {
    pub fn from_metadata(md: &std::fs::Metadata) -> Self {
        let ft = md.file_type();
        let kind = if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_file() {
            FileKind::File
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Other
        };

        Self {
            kind,
            size: md.len(),
            mtime: md.modified().ok(),
            birthtime: md.created().ok(),
            ino: inode_of(md),
            mode: mode_of(md),
            atime: md.accessed().ok(),
            ctime: ctime_of(md),
        }
    }

    /// Field-by-field inequality with `atime`/`ctime` excluded.
    pub fn differs_from(&self, other: &StatSnapshot) -> bool {
        self.kind != other.kind
            || self.size != other.size
            || self.mtime != other.mtime
            || self.birthtime != other.birthtime
            || self.ino != other.ino
            || self.mode != other.mode
    }

    /// Same underlying inode? Both `birthtime`s present and differing means a
    /// replacement; absent birthtimes fall back to inode identity.
    pub fn same_identity(&self, other: &StatSnapshot) -> bool {
        match (self.birthtime, other.birthtime) {
            (Some(a), Some(b)) => a == b,
            _ => self.ino == 0 || other.ino == 0 || self.ino == other.ino,
        }
    }
}

/// Decide whether two snapshots represent a meaningful change.
///
/// Exactly one side absent means creation or deletion (`true`); both absent
/// means nothing to report (`false`).
pub fn changed(old: Option<&StatSnapshot>, current: Option<&StatSnapshot>) -> bool {
    match (old, current) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(a), Some(b)) => a.differs_from(b),
    }
}

/// Capture a snapshot, following the final symlink per `follow_links`.
pub async fn snapshot(path: &Path, follow_links: bool) -> io::Result<StatSnapshot> {
    let md = if follow_links {
        tokio::fs::metadata(path).await?
    } else {
        tokio::fs::symlink_metadata(path).await?
    };
    Ok(StatSnapshot::from_metadata(&md))
}

#[cfg(unix)]
#[inline]
fn inode_of(md: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.ino()
}

#[cfg(not(unix))]
#[inline]
fn inode_of(_md: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(unix)]
#[inline]
fn mode_of(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
#[inline]
fn mode_of(_md: &std::fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn ctime_of(md: &std::fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;
    let secs = md.ctime();
    let nsec = md.ctime_nsec() as u32;
    if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::new(secs as u64, nsec))
    } else {
        UNIX_EPOCH.checked_sub(Duration::new(secs.unsigned_abs(), 0))
    }
}

#[cfg(not(unix))]
fn ctime_of(_md: &std::fs::Metadata) -> Option<SystemTime> {
    None
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(size: u64) -> StatSnapshot {
        StatSnapshot {
            kind: FileKind::File,
            size,
            mtime: Some(UNIX_EPOCH + Duration::from_secs(1_000)),
            birthtime: Some(UNIX_EPOCH + Duration::from_secs(900)),
            ino: 42,
            mode: 0o644,
            atime: Some(UNIX_EPOCH + Duration::from_secs(1_100)),
            ctime: Some(UNIX_EPOCH + Duration::from_secs(1_000)),
        }
    }

    #[test]
    fn one_sided_absence_is_a_change() {
        let s = sample(10);
        assert!(changed(None, Some(&s)));
        assert!(changed(Some(&s), None));
        assert!(!changed(None, None));
    }

    #[test]
    fn size_delta_is_a_change() {
        let a = sample(10);
        let b = sample(20);
        assert!(changed(Some(&a), Some(&b)));
    }

    #[test]
    fn equal_snapshots_are_not_a_change() {
        let a = sample(10);
        let b = a.clone();
        assert!(!changed(Some(&a), Some(&b)));
    }

    #[test]
    fn atime_ctime_do_not_count() {
        let a = sample(10);
        let mut b = a.clone();
        b.atime = Some(UNIX_EPOCH + Duration::from_secs(9_999));
        b.ctime = None;
        assert!(!changed(Some(&a), Some(&b)));
    }

    #[test]
    fn identity_prefers_birthtime() {
        let a = sample(10);
        let mut b = a.clone();
        b.birthtime = Some(UNIX_EPOCH + Duration::from_secs(901));
        assert!(!a.same_identity(&b));

        // no birthtime on either side: inode decides
        let mut c = a.clone();
        c.birthtime = None;
        let mut d = a.clone();
        d.birthtime = None;
        d.ino = 43;
        assert!(!c.same_identity(&d));
        d.ino = 42;
        assert!(c.same_identity(&d));
    }

    proptest! {
        // Snapshots differing only in atime/ctime never report a change.
        #[test]
        fn access_time_jitter_is_invisible(
            size in 0u64..1_000_000,
            ino in 1u64..1_000_000,
            mode in 0u32..0o7777,
            at_a in 0u64..10_000_000,
            at_b in 0u64..10_000_000,
            ct_a in 0u64..10_000_000,
            ct_b in 0u64..10_000_000,
        ) {
            let mut a = sample(size);
            a.ino = ino;
            a.mode = mode;
            a.atime = Some(UNIX_EPOCH + Duration::from_secs(at_a));
            a.ctime = Some(UNIX_EPOCH + Duration::from_secs(ct_a));

            let mut b = a.clone();
            b.atime = Some(UNIX_EPOCH + Duration::from_secs(at_b));
            b.ctime = Some(UNIX_EPOCH + Duration::from_secs(ct_b));

            prop_assert!(!changed(Some(&a), Some(&b)));
        }
    }
}
