//! Configuration system for the Colloquy client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/colloquy/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use colloquy_proto::wire::ApiVersion;

use crate::chat::ChatConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The configured API version is not one the client speaks.
    #[error("unsupported api version {0:?}")]
    ApiVersion(String),

    /// The calendar offset is outside +/- 24 hours.
    #[error("calendar offset {0} minutes is out of range")]
    CalendarOffset(i32),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    chat: ChatFileConfig,
    receipts: ReceiptsFileConfig,
    typing: TypingFileConfig,
    media: MediaFileConfig,
    storage: StorageFileConfig,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    api_version: Option<String>,
    event_buffer: Option<usize>,
    warning_buffer: Option<usize>,
    calendar_offset_minutes: Option<i32>,
}

/// `[receipts]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReceiptsFileConfig {
    debounce_ms: Option<u64>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    start_interval_secs: Option<u64>,
    stop_delay_secs: Option<u64>,
    agent_timeout_secs: Option<u64>,
}

/// `[media]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct MediaFileConfig {
    max_size_bytes: Option<usize>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Chat --
    /// Protocol version spoken with the service.
    pub api_version: ApiVersion,
    /// Buffer size for the chat event channel.
    pub event_buffer: usize,
    /// Buffer size for the history warning channel.
    pub warning_buffer: usize,
    /// Offset from UTC used to bucket messages into days.
    pub calendar_offset: FixedOffset,

    // -- Signals --
    /// Quiet period before read acknowledgements are flushed.
    pub read_debounce: Duration,
    /// Minimum gap between two typing start events.
    pub typing_start_interval: Duration,
    /// Idle time before the typing stop event.
    pub typing_stop_delay: Duration,
    /// How long an agent typing indicator lives without a refresh.
    pub agent_typing_timeout: Duration,

    // -- Media --
    /// Largest accepted media upload in bytes.
    pub max_media_size: usize,

    // -- Storage --
    /// Snapshot file for the local message store. `None` keeps history
    /// in memory only.
    pub store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let chat = ChatConfig::default();
        Self {
            api_version: chat.api_version,
            event_buffer: chat.event_buffer,
            warning_buffer: chat.warning_buffer,
            calendar_offset: chat.calendar_offset,
            read_debounce: chat.read_debounce,
            typing_start_interval: chat.typing_start_interval,
            typing_stop_delay: chat.typing_stop_delay,
            agent_typing_timeout: chat.agent_typing_timeout,
            max_media_size: chat.max_media_size,
            store_path: default_store_path(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/colloquy/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a value in it is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_version = match cli
            .api_version
            .as_deref()
            .or(file.chat.api_version.as_deref())
        {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::ApiVersion(raw.to_string()))?,
            None => defaults.api_version,
        };

        let calendar_offset = match file.chat.calendar_offset_minutes {
            Some(minutes) => FixedOffset::east_opt(minutes.saturating_mul(60))
                .ok_or(ConfigError::CalendarOffset(minutes))?,
            None => defaults.calendar_offset,
        };

        let store_path = if cli.in_memory {
            None
        } else {
            cli.store
                .clone()
                .or_else(|| file.storage.path.clone())
                .or(defaults.store_path)
        };

        Ok(Self {
            api_version,
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
            warning_buffer: file.chat.warning_buffer.unwrap_or(defaults.warning_buffer),
            calendar_offset,
            read_debounce: file
                .receipts
                .debounce_ms
                .map_or(defaults.read_debounce, Duration::from_millis),
            typing_start_interval: file
                .typing
                .start_interval_secs
                .map_or(defaults.typing_start_interval, Duration::from_secs),
            typing_stop_delay: file
                .typing
                .stop_delay_secs
                .map_or(defaults.typing_stop_delay, Duration::from_secs),
            agent_typing_timeout: file
                .typing
                .agent_timeout_secs
                .map_or(defaults.agent_typing_timeout, Duration::from_secs),
            max_media_size: file.media.max_size_bytes.unwrap_or(defaults.max_media_size),
            store_path,
        })
    }

    /// The engine settings carried by this configuration.
    #[must_use]
    pub const fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            api_version: self.api_version,
            event_buffer: self.event_buffer,
            warning_buffer: self.warning_buffer,
            calendar_offset: self.calendar_offset,
            read_debounce: self.read_debounce,
            typing_start_interval: self.typing_start_interval,
            typing_stop_delay: self.typing_stop_delay,
            agent_typing_timeout: self.agent_typing_timeout,
            max_media_size: self.max_media_size,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Client-side chat engine demo")]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/colloquy/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Protocol version spoken with the service (v1.6, v1.7, v1.8).
    #[arg(long, env = "COLLOQUY_API_VERSION")]
    pub api_version: Option<String>,

    /// Snapshot file for the local message store.
    #[arg(long, env = "COLLOQUY_STORE")]
    pub store: Option<PathBuf>,

    /// Keep history in memory only.
    #[arg(long)]
    pub in_memory: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COLLOQUY_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/colloquy.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_store_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("colloquy").join("history.bin"))
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("colloquy").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
