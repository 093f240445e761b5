use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{ChangeEvent, CloseReason, NodeEvent, WatchConfig};

mod settings;
use settings::{parse_method, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    about = "Recursive filesystem watcher emitting semantic create/update/delete events",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a path and stream change events
    Watch {
        /// Path to watch recursively
        path: PathBuf,
        /// Poll period in milliseconds (poll method only)
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Debounce window in milliseconds
        #[arg(long)]
        catchup_ms: Option<u64>,
        /// Preferred methods in fallback order (event, poll); repeatable
        #[arg(long = "method")]
        methods: Vec<String>,
        /// Do not follow symlinks when stat-ing watched paths
        #[arg(long)]
        no_follow_links: bool,
        /// Skip entries whose name starts with a dot
        #[arg(long)]
        ignore_hidden: bool,
        /// Keep watching VCS dirs, swap files and other common junk
        #[arg(long)]
        no_common_ignores: bool,
        /// Extra ignore glob; repeatable
        #[arg(long = "ignore")]
        ignore_patterns: Vec<String>,
        /// Path excluded together with everything beneath it; repeatable
        #[arg(long = "ignore-path")]
        ignore_paths: Vec<PathBuf>,
        /// One JSON object per event instead of human-readable lines
        #[arg(long)]
        json: bool,
    },
    /// List a directory's children as the watcher would see them
    Scan {
        /// Directory to list (non-recursive)
        path: PathBuf,
        /// Skip entries whose name starts with a dot
        #[arg(long)]
        ignore_hidden: bool,
        /// Keep common junk in the listing
        #[arg(long)]
        no_common_ignores: bool,
        /// Extra ignore glob; repeatable
        #[arg(long = "ignore")]
        ignore_patterns: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info,vigil_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Watch {
            path,
            interval_ms,
            catchup_ms,
            methods,
            no_follow_links,
            ignore_hidden,
            no_common_ignores,
            ignore_patterns,
            ignore_paths,
            json,
        } => {
            let mut s = Settings::load()?.watcher;
            if let Some(ms) = interval_ms {
                s.interval_ms = ms;
            }
            if let Some(ms) = catchup_ms {
                s.catchup_delay_ms = ms;
            }
            if !methods.is_empty() {
                for m in &methods {
                    parse_method(m)?;
                }
                s.methods = methods;
            }
            if no_follow_links {
                s.follow_links = false;
            }
            if ignore_hidden {
                s.ignore_hidden_files = true;
            }
            if no_common_ignores {
                s.ignore_common_patterns = false;
            }
            s.ignore_patterns.extend(ignore_patterns);
            s.ignore_paths
                .extend(ignore_paths.iter().map(|p| p.display().to_string()));

            run_watch(path, s.into_watch_config()?, json).await
        }
        Commands::Scan {
            path,
            ignore_hidden,
            no_common_ignores,
            ignore_patterns,
        } => {
            let opts = vigil_core::IgnoreOptions {
                ignore_hidden_files: ignore_hidden,
                ignore_common_patterns: !no_common_ignores,
                ..Default::default()
            }
            .with_custom_patterns(&ignore_patterns)?;

            let entries = vigil_core::scan::list_dir(&path, true, &opts).await?;
            for entry in entries {
                println!("{}", entry.path.display());
            }
            Ok(())
        }
    }
}

async fn run_watch(path: PathBuf, cfg: WatchConfig, json: bool) -> Result<()> {
    let node = vigil_core::watch(&path, cfg).await?;
    info!(path = %node.path().display(), method = ?node.method(), "watching");

    let mut events = node.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing watcher");
                node.close(CloseReason::Normal).await;
                break;
            }
            event = events.recv() => match event {
                Ok(NodeEvent::Change(change)) => print_change(&change, json)?,
                Ok(NodeEvent::Error(e)) => warn!("watcher error: {e}"),
                Ok(NodeEvent::Close(reason)) => {
                    info!(?reason, "watcher closed");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged, some events were dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let stats = node.stats();
    info!(
        raw = stats.raw_signals,
        batches = stats.batches,
        emitted = stats.events_emitted,
        bubbled = stats.bubbled,
        "final counters"
    );
    Ok(())
}

fn print_change(change: &ChangeEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(change)?);
    } else {
        let size = change
            .current
            .as_ref()
            .map(|s| format!(" ({} bytes)", s.size))
            .unwrap_or_default();
        println!(
            "{} {:6} {}{}",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            change.kind.to_string(),
            change.path.display(),
            size
        );
    }
    Ok(())
}
