//! Runtime Configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `QUARK_`-prefixed environment variables (`__` separates sections, so
//! `QUARK_ENGINE__MEMORY_LIMIT_MB=32` sets `engine.memory_limit_mb`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "quark.toml";

const ENV_PREFIX: &str = "QUARK_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid sandbox settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuarkConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub app: AppConfig,
}

impl QuarkConfig {
    /// Defaults, then `quark.toml` in the working directory if present, then
    /// the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        let file = default_file.exists().then_some(default_file);
        Self::figment(file).extract().map_err(|e| Box::new(e).into())
    }

    /// Defaults, then the TOML file at `path`, then the environment. The
    /// file must exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::figment(Some(path))
            .extract()
            .map_err(|e| Box::new(e).into())
    }

    /// The provider stack behind [`load`](Self::load), exposed so callers can
    /// merge more layers (CLI flags) on top.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(QuarkConfig::default()));
        if let Some(file) = file {
            figment = figment.merge(Toml::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

/// Flag that carries [`SandboxSettings`] on the sandbox host's command line.
pub const SANDBOX_SETTINGS_FLAG: &str = "--settings";

/// The sections of the app's configuration a sandbox process must share.
/// Passed to the peer as JSON so both sides run with the same limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SandboxSettings {
    pub fn from_config(config: &QuarkConfig) -> Self {
        Self {
            engine: config.engine.clone(),
            channel: config.channel.clone(),
            logging: config.logging.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Replace the matching sections of `config`.
    pub fn apply_to(self, config: &mut QuarkConfig) {
        config.engine = self.engine;
        config.channel = self.channel;
        config.logging = self.logging;
    }
}

/// Which engine backend runs scripts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    InProcess,
    Sandbox,
}

/// Script engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: usize,
    #[serde(default = "default_max_stack_kb")]
    pub max_stack_kb: usize,
    /// Replacement for the embedded framework script.
    #[serde(default)]
    pub framework: Option<PathBuf>,
}

fn default_memory_limit_mb() -> usize {
    64
}

fn default_max_stack_kb() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            memory_limit_mb: default_memory_limit_mb(),
            max_stack_kb: default_max_stack_kb(),
            framework: None,
        }
    }
}

impl EngineConfig {
    pub fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_stack_bytes(&self) -> usize {
        self.max_stack_kb.saturating_mul(1024)
    }
}

/// Duplex channel settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Per-call deadline. Unset means calls wait until answered or until the
    /// peer dies.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl ChannelConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Sandbox process settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Path to the peer binary. Unset means `quark-sandbox-host` next to the
    /// current executable.
    #[serde(default)]
    pub host_binary: Option<PathBuf>,
    /// Start the peer in the background as soon as the launcher exists.
    #[serde(default)]
    pub prestart: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_filter() -> String {
    "quark=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

/// Application lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Delay between the shutdown request and engine disposal.
    #[serde(default)]
    pub shutdown_delay_ms: u64,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub country: String,
    /// How long a new page may take to finish its first render.
    #[serde(default = "default_page_ready_timeout_ms")]
    pub page_ready_timeout_ms: u64,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_page_ready_timeout_ms() -> u64 {
    10_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            shutdown_delay_ms: 0,
            language: default_language(),
            country: String::new(),
            page_ready_timeout_ms: default_page_ready_timeout_ms(),
        }
    }
}

impl AppConfig {
    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    pub fn page_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.page_ready_timeout_ms)
    }
}
