//! Server configuration: TOML file + CLI overrides.

use crate::auth::ThrottlePolicy;
use crate::console::hub::{DEFAULT_BUFFER_CAPACITY, DEFAULT_SUBSCRIBER_QUEUE};
use crate::process::local::ProcessSpec;
use panel_core::{PanelError, PanelResult};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub console: ConsoleSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessSpec>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[console]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSection {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default)]
    pub record_dir: Option<String>,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            subscriber_queue: default_subscriber_queue(),
            record_dir: None,
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub secure_cookie: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_window_secs")]
    pub failure_window: u64,
    #[serde(default = "default_window_secs")]
    pub lockout: u64,
    /// identity → Argon2id PHC string of the password.
    #[serde(default)]
    pub users: HashMap<String, String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            session_ttl: default_session_ttl(),
            cookie_name: default_cookie_name(),
            secure_cookie: false,
            max_failures: default_max_failures(),
            failure_window: default_window_secs(),
            lockout: default_window_secs(),
            users: HashMap::new(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    8080
}
fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}
fn default_subscriber_queue() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE
}
fn default_session_ttl() -> u64 {
    7 * 24 * 60 * 60
}
fn default_cookie_name() -> String {
    "panel_session".to_string()
}
fn default_max_failures() -> u32 {
    10
}
fn default_window_secs() -> u64 {
    15 * 60
}

/// CLI values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub buffer_capacity: Option<usize>,
    pub session_ttl: Option<u64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub buffer_capacity: usize,
    pub subscriber_queue: usize,
    pub record_dir: Option<PathBuf>,
    pub session_ttl: Duration,
    pub cookie_name: String,
    pub secure_cookie: bool,
    pub throttle: ThrottlePolicy,
    pub users: HashMap<String, String>,
    pub processes: Vec<ProcessSpec>,
}

impl ServerConfig {
    /// Load config from a TOML file (missing file = defaults), then apply
    /// CLI overrides and validate.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> PanelResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    pub fn parse(content: &str) -> PanelResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| PanelError::Config(format!("config parse error: {e}")))
    }

    /// Merge CLI overrides into a parsed file and check invariants.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> PanelResult<Self> {
        let bind = overrides.bind.unwrap_or(file.server.bind);
        let port = overrides.port.unwrap_or(file.server.port);
        let buffer_capacity = overrides
            .buffer_capacity
            .unwrap_or(file.console.buffer_capacity);
        let session_ttl = overrides.session_ttl.unwrap_or(file.auth.session_ttl);

        if buffer_capacity == 0 {
            return Err(PanelError::Config("console.buffer_capacity must be at least 1".into()));
        }
        if file.console.subscriber_queue == 0 {
            return Err(PanelError::Config("console.subscriber_queue must be at least 1".into()));
        }
        if session_ttl == 0 {
            return Err(PanelError::Config("auth.session_ttl must be positive".into()));
        }
        if file.auth.max_failures == 0 {
            return Err(PanelError::Config("auth.max_failures must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for process in &file.processes {
            if process.id.trim().is_empty() {
                return Err(PanelError::Config("process id must not be empty".into()));
            }
            if !seen.insert(process.id.as_str()) {
                return Err(PanelError::Config(format!(
                    "duplicate process id: {}",
                    process.id
                )));
            }
        }

        Ok(Self {
            listen: SocketAddr::new(bind, port),
            buffer_capacity,
            subscriber_queue: file.console.subscriber_queue,
            record_dir: file.console.record_dir.as_deref().map(expand_tilde_str),
            session_ttl: Duration::from_secs(session_ttl),
            cookie_name: file.auth.cookie_name,
            secure_cookie: file.auth.secure_cookie,
            throttle: ThrottlePolicy {
                max_failures: file.auth.max_failures,
                window: Duration::from_secs(file.auth.failure_window),
                lockout: Duration::from_secs(file.auth.lockout),
            },
            users: file.auth.users,
            processes: file.processes,
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
