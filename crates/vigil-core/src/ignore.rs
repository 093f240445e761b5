//! Ignore oracle: is a path excluded by the configured filters?
//!
//! Pure predicate over a path and an [`IgnoreOptions`]; no filesystem access.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Junk nobody wants change events for: VCS metadata, dependency caches,
/// editor swap/backup files, OS litter.
const COMMON_PATTERNS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".bzr",
    "CVS",
    "node_modules",
    ".DS_Store",
    "Thumbs.db",
    "Desktop.ini",
    "*.swp",
    "*.swo",
    "*~",
    "#*#",
    ".#*",
];

fn common_set() -> &'static GlobSet {
    static SET: OnceLock<GlobSet> = OnceLock::new();
    SET.get_or_init(|| {
        let mut builder = GlobSetBuilder::new();
        for pat in COMMON_PATTERNS {
            // Patterns are static and known-good.
            builder.add(Glob::new(pat).expect("common ignore pattern"));
        }
        builder.build().expect("common ignore set")
    })
}

#[derive(Debug, Clone)]
pub struct IgnoreOptions {
    /// Absolute paths excluded together with everything beneath them.
    pub ignore_paths: Vec<PathBuf>,
    /// Exclude entries whose name starts with a dot.
    pub ignore_hidden_files: bool,
    /// Exclude the built-in junk patterns.
    pub ignore_common_patterns: bool,
    /// Caller-supplied globs, matched against the file name and full path.
    pub ignore_custom_patterns: Option<Arc<GlobSet>>,
}

impl Default for IgnoreOptions {
    fn default() -> Self {
        Self {
            ignore_paths: Vec::new(),
            ignore_hidden_files: false,
            ignore_common_patterns: true,
            ignore_custom_patterns: None,
        }
    }
}

impl IgnoreOptions {
    /// Compile caller-supplied glob strings into the custom pattern set.
    pub fn with_custom_patterns(mut self, patterns: &[String]) -> Result<Self, globset::Error> {
        if patterns.is_empty() {
            self.ignore_custom_patterns = None;
            return Ok(self);
        }
        let mut builder = GlobSetBuilder::new();
        for p in patterns {
            builder.add(Glob::new(p)?);
        }
        self.ignore_custom_patterns = Some(Arc::new(builder.build()?));
        Ok(self)
    }
}

/// Test a path against the configured filters.
pub fn is_ignored(path: &Path, opts: &IgnoreOptions) -> bool {
    for root in &opts.ignore_paths {
        if path == root || path.starts_with(root) {
            return true;
        }
    }

    let name = path.file_name().and_then(|n| n.to_str());

    if opts.ignore_hidden_files {
        if let Some(name) = name {
            if name.starts_with('.') {
                return true;
            }
        }
    }

    if opts.ignore_common_patterns {
        if let Some(name) = name {
            if common_set().is_match(name) {
                return true;
            }
        }
    }

    if let Some(custom) = &opts.ignore_custom_patterns {
        if custom.is_match(path) {
            return true;
        }
        if let Some(name) = name {
            if custom.is_match(name) {
                return true;
            }
        }
    }

    false
}

// ---------------------------- Tests ----------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_paths_cover_descendants() {
        let opts = IgnoreOptions {
            ignore_paths: vec![PathBuf::from("/tmp/skip")],
            ..Default::default()
        };
        assert!(is_ignored(Path::new("/tmp/skip"), &opts));
        assert!(is_ignored(Path::new("/tmp/skip/deep/file.txt"), &opts));
        assert!(!is_ignored(Path::new("/tmp/skipped"), &opts));
    }

    #[test]
    fn hidden_files_only_when_enabled() {
        let mut opts = IgnoreOptions {
            ignore_common_patterns: false,
            ..Default::default()
        };
        assert!(!is_ignored(Path::new("/a/.hidden"), &opts));
        opts.ignore_hidden_files = true;
        assert!(is_ignored(Path::new("/a/.hidden"), &opts));
        assert!(!is_ignored(Path::new("/a/visible"), &opts));
    }

    #[test]
    fn common_patterns_cover_vcs_and_swap_files() {
        let opts = IgnoreOptions::default();
        assert!(is_ignored(Path::new("/repo/.git"), &opts));
        assert!(is_ignored(Path::new("/repo/node_modules"), &opts));
        assert!(is_ignored(Path::new("/repo/src/main.rs.swp"), &opts));
        assert!(is_ignored(Path::new("/repo/notes.txt~"), &opts));
        assert!(!is_ignored(Path::new("/repo/src/main.rs"), &opts));
    }

    #[test]
    fn custom_patterns_match_name_and_path() {
        let opts = IgnoreOptions::default()
            .with_custom_patterns(&["*.log".to_string(), "build/**".to_string()])
            .unwrap();
        assert!(is_ignored(Path::new("/srv/daemon.log"), &opts));
        assert!(is_ignored(Path::new("build/out/app.bin"), &opts));
        assert!(!is_ignored(Path::new("/srv/daemon.rs"), &opts));
    }
}
