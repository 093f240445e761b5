//! Recursive filesystem watcher.
//!
//! Given a root path, emits semantic change events (`create`, `update`,
//! `delete`) for that path and every descendant, keeping a tree of per-path
//! watcher nodes synchronised with the filesystem.
//!
//! Raw OS notifications are unreliable: a single logical change (an editor's
//! swap-file save, say) fires several raw events in unpredictable order
//! across a file and its parent directory. Each node therefore debounces its
//! raw notifications and runs one reconciliation pass per quiet window,
//! comparing stat snapshots and rescanning directory contents to decide what
//! actually happened.
//!
//! ```no_run
//! use vigil_core::{watch, NodeEvent, WatchConfig};
//!
//! # async fn demo() -> Result<(), vigil_core::WatchError> {
//! let node = watch("/some/dir", WatchConfig::default()).await?;
//! let mut events = node.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let NodeEvent::Change(change) = event {
//!         println!("{} {}", change.kind, change.path.display());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod events;
pub mod ignore;
pub mod node;
pub mod registry;
pub mod scan;
pub mod stat;
pub mod stats;

pub use config::{WatchConfig, WatchMethod};
pub use events::{ChangeEvent, ChangeKind, CloseReason, LogLevel, LogLine, NodeEvent};
pub use ignore::IgnoreOptions;
pub use node::{NodeHandle, WatchError, WatchState};
pub use registry::watch;
pub use stat::{changed, FileKind, StatSnapshot};
pub use stats::WatchStatsSnapshot;
