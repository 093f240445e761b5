//! Directory scanner: non-recursive child enumeration with ignore filtering.

use crate::ignore::{is_ignored, IgnoreOptions};
use crate::stat::{self, StatSnapshot};
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub name: OsString,
    pub path: PathBuf,
    /// Absent when the entry vanished between listing and stat.
    pub stat: Option<StatSnapshot>,
}

/// List the direct children of `path`, skipping ignored entries.
///
/// Entries come back sorted by name so scans are deterministic regardless of
/// readdir order.
pub async fn list_dir(
    path: &Path,
    follow_links: bool,
    ignore: &IgnoreOptions,
) -> io::Result<Vec<ScanEntry>> {
    let mut rd = tokio::fs::read_dir(path).await?;
    let mut out = Vec::new();

    while let Some(entry) = rd.next_entry().await? {
        let full = entry.path();
        if is_ignored(&full, ignore) {
            continue;
        }
        let stat = stat::snapshot(&full, follow_links).await.ok();
        out.push(ScanEntry {
            name: entry.file_name(),
            path: full,
            stat,
        });
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lists_children_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();

        let entries = list_dir(dir.path(), true, &IgnoreOptions::default())
            .await
            .unwrap();

        let names: Vec<_> = entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(entries.iter().all(|e| e.stat.is_some()));
    }

    #[tokio::test]
    async fn missing_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("nope");
        assert!(list_dir(&gone, true, &IgnoreOptions::default())
            .await
            .is_err());
    }
}
