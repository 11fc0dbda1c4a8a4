//! Session configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration. Command-line flags override what is loaded here.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub heap: HeapConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Number of non-blocking attempts a client makes on the session lock
    /// before failing with `Error::Busy`.
    #[serde(default = "SessionConfig::default_lock_trials")]
    pub lock_trials: u32,

    /// Pause between two lock attempts, in microseconds.
    #[serde(default = "SessionConfig::default_lock_retry_interval_us")]
    pub lock_retry_interval_us: u64,

    /// Upper bound on frames produced by one stack walk.
    #[serde(default = "SessionConfig::default_max_stack_depth")]
    pub max_stack_depth: usize,

    /// Address of the boot image header. Backends that know it override this.
    #[serde(default)]
    pub boot_image_address: Option<u64>,
}

impl SessionConfig {
    fn default_lock_trials() -> u32 {
        100
    }

    fn default_lock_retry_interval_us() -> u64 {
        50
    }

    fn default_max_stack_depth() -> usize {
        256
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            lock_trials: Self::default_lock_trials(),
            lock_retry_interval_us: Self::default_lock_retry_interval_us(),
            max_stack_depth: Self::default_max_stack_depth(),
            boot_image_address: None,
        }
    }
}

/// Garbage collector used by the inspected VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HeapSchemeKind {
    #[default]
    SemiSpace,
    MarkSweep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HeapConfig {
    #[serde(default)]
    pub scheme: HeapSchemeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Hardware watchpoint slots offered by the remote stub.
    #[serde(default = "RemoteConfig::default_watchpoint_slots")]
    pub watchpoint_slots: usize,

    /// Socket read timeout for request/response packets, in milliseconds.
    #[serde(default = "RemoteConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RemoteConfig {
    fn default_watchpoint_slots() -> usize {
        4
    }

    fn default_timeout_ms() -> u64 {
        5_000
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            watchpoint_slots: Self::default_watchpoint_slots(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or an `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "warn".to_owned()
    }

    fn normalize_level(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "warning" => "warn".to_owned(),
            "trace" | "debug" | "info" | "warn" | "error" => trimmed.to_ascii_lowercase(),
            _ => trimmed.to_owned(),
        }
    }

    /// Effective filter: the configured directives merged with `RUST_LOG`.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let configured = Self::normalize_level(&self.level);
        let directives = match std::env::var("RUST_LOG") {
            Ok(env) if !env.trim().is_empty() => format!("{},{}", configured, env.trim()),
            _ => configured,
        };
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Self::default_level(),
            json: false,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session.lock_trials == 0 {
            return Err(Error::Config("session.lock_trials must be at least 1".into()));
        }
        if self.session.max_stack_depth == 0 {
            return Err(Error::Config("session.max_stack_depth must be at least 1".into()));
        }
        Ok(())
    }
}

/// Install the global `tracing` subscriber writing to stderr.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    let filter = config.env_filter();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
