//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `DESKBRIDGE_DATA_DIR`, `DESKBRIDGE_SIDECAR`,
//!    `DESKBRIDGE_SERVER_PASSWORD`, `DESKBRIDGE_BASE_URL`
//! 2. **Config file**: path via `--config <path>`, or `deskbridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [storage]
//! data_dir = "~/.local/share/deskbridge"
//! debounce_ms = 250
//!
//! [sidecar]
//! program = "opencode-cli"
//! args = ["bridge"]
//! use_login_shell = true
//!
//! [fetch]
//! base_url = "http://127.0.0.1:4096"   # optional
//! log_body_limit = 1024
//! timeout_secs = 30
//! connect_timeout_secs = 10
//!
//! [prompt]
//! queue_capacity = 32
//!
//! [server]
//! password = "..."   # optional, generated per run when omitted
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Debounced storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one `<namespace>.json` file per namespace.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Quiet period before pending writes are flushed (default 250).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// How to launch the host sidecar.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarConfig {
    /// Sidecar binary. Override with `DESKBRIDGE_SIDECAR`.
    #[serde(default = "default_sidecar_program")]
    pub program: String,
    #[serde(default = "default_sidecar_args")]
    pub args: Vec<String>,
    /// Launch through `$SHELL -il -c` on unix (default true).
    #[serde(default = "default_true")]
    pub use_login_shell: bool,
}

/// Fetch router settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Base URL for relative request paths. Override with `DESKBRIDGE_BASE_URL`.
    pub base_url: Option<String>,
    /// Maximum response body bytes included in failure diagnostics.
    #[serde(default = "default_log_body_limit")]
    pub log_body_limit: usize,
    /// Time allowed for response headers to arrive. Bodies are not limited,
    /// so streaming endpoints stay open.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Prompt relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    /// Capacity of the channel between the host and the relay (default 32).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Local server credential.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Password handed to the sidecar and used as the ambient fetch
    /// credential. Override with `DESKBRIDGE_SERVER_PASSWORD`. A random one is
    /// generated per run when unset.
    pub password: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> String {
    "~/.local/share/deskbridge".to_string()
}
fn default_debounce_ms() -> u64 {
    250
}
fn default_sidecar_program() -> String {
    "opencode-cli".to_string()
}
fn default_sidecar_args() -> Vec<String> {
    vec!["bridge".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_log_body_limit() -> usize {
    1024
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    32
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            program: default_sidecar_program(),
            args: default_sidecar_args(),
            use_login_shell: default_true(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            log_body_limit: default_log_body_limit(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `deskbridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("deskbridge.toml").exists() => {
                Self::from_file(Path::new("deskbridge.toml"))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.storage.data_dir = expand_tilde(&config.storage.data_dir).into_owned();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    /// Apply env overrides, reading variables through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("DESKBRIDGE_DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(program) = var("DESKBRIDGE_SIDECAR") {
            self.sidecar.program = program;
        }
        if let Some(password) = var("DESKBRIDGE_SERVER_PASSWORD") {
            self.server.password = Some(password);
        }
        if let Some(url) = var("DESKBRIDGE_BASE_URL") {
            self.fetch.base_url = Some(url);
        }
    }
}
