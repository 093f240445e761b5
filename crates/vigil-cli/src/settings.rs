//! Layered settings: defaults, then `vigil.toml` (local or
//! `~/.config/vigil/config.toml`), then `VIGIL__*` environment variables.
//! Command-line flags win over everything.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use vigil_core::{IgnoreOptions, WatchConfig, WatchMethod};

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub watcher: WatcherSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherSettings {
    pub interval_ms: u64,
    pub catchup_delay_ms: u64,
    pub persistent: bool,
    pub methods: Vec<String>,
    pub follow_links: bool,
    pub ignore_hidden_files: bool,
    pub ignore_common_patterns: bool,
    pub ignore_paths: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        let defaults = WatchConfig::default();
        Self {
            interval_ms: defaults.interval.as_millis() as u64,
            catchup_delay_ms: defaults.catchup_delay.as_millis() as u64,
            persistent: defaults.persistent,
            methods: vec!["event".to_string(), "poll".to_string()],
            follow_links: defaults.follow_links,
            ignore_hidden_files: false,
            ignore_common_patterns: true,
            ignore_paths: Vec::new(),
            ignore_patterns: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = WatcherSettings::default();
        let builder = Config::builder()
            .set_default("watcher.interval_ms", defaults.interval_ms)?
            .set_default("watcher.catchup_delay_ms", defaults.catchup_delay_ms)?
            .set_default("watcher.persistent", defaults.persistent)?
            .set_default("watcher.methods", defaults.methods.clone())?
            .set_default("watcher.follow_links", defaults.follow_links)?
            .set_default("watcher.ignore_hidden_files", defaults.ignore_hidden_files)?
            .set_default(
                "watcher.ignore_common_patterns",
                defaults.ignore_common_patterns,
            )?
            .set_default("watcher.ignore_paths", Vec::<String>::new())?
            .set_default("watcher.ignore_patterns", Vec::<String>::new())?
            // Local config
            .add_source(File::with_name("vigil").required(false))
            // Global config
            .add_source(
                File::with_name(&format!(
                    "{}/.config/vigil/config",
                    std::env::var("HOME").unwrap_or_else(|_| ".".into())
                ))
                .required(false),
            )
            // Env vars: VIGIL__WATCHER__INTERVAL_MS
            .add_source(Environment::with_prefix("VIGIL").separator("__"));

        builder.build()?.try_deserialize()
    }
}

pub fn parse_method(s: &str) -> anyhow::Result<WatchMethod> {
    match s.to_ascii_lowercase().as_str() {
        "event" => Ok(WatchMethod::Event),
        "poll" => Ok(WatchMethod::Poll),
        other => anyhow::bail!("unknown watch method '{other}' (expected 'event' or 'poll')"),
    }
}

// Conversion to the library's typed config
impl WatcherSettings {
    pub fn into_watch_config(self) -> anyhow::Result<WatchConfig> {
        let mut methods = Vec::new();
        for m in &self.methods {
            methods.push(parse_method(m)?);
        }

        let ignore = IgnoreOptions {
            ignore_paths: self.ignore_paths.iter().map(Into::into).collect(),
            ignore_hidden_files: self.ignore_hidden_files,
            ignore_common_patterns: self.ignore_common_patterns,
            ignore_custom_patterns: None,
        }
        .with_custom_patterns(&self.ignore_patterns)?;

        Ok(WatchConfig {
            interval: Duration::from_millis(self.interval_ms),
            persistent: self.persistent,
            catchup_delay: Duration::from_millis(self.catchup_delay_ms),
            preferred_methods: methods,
            follow_links: self.follow_links,
            ignore,
        })
    }
}
