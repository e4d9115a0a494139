//! Client configuration at `~/.panel/config.toml` and the saved session at
//! `~/.panel/session`.
//!
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default connection settings.
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultConfig {
    /// Panel base URL.
    #[serde(default = "default_url")]
    pub url: String,

    /// Default login name (empty = ask).
    #[serde(default)]
    pub username: String,

    /// Session cookie name used by the server.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: String::new(),
            cookie_name: default_cookie_name(),
        }
    }
}

fn default_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_cookie_name() -> String {
    "panel_session".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// `~/.panel`.
pub fn panel_dir() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("cannot determine home directory")?
        .join(".panel"))
}

/// A session token bound to the server that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub url: String,
    pub token: String,
}

/// Where `login` stores the session.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Result<Self> {
        Ok(Self::new(panel_dir()?.join("session")))
    }

    /// The saved token for `url`, if any.
    pub fn load(&self, url: &str) -> Result<Option<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        let saved: SavedSession = match serde_json::from_str(&content) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable session file");
                return Ok(None);
            }
        };
        if saved.url != url {
            debug!(saved = %saved.url, url, "saved session belongs to another server");
            return Ok(None);
        }
        Ok(Some(saved.token))
    }

    /// Persist a session, readable only by the owner.
    pub fn save(&self, session: &SavedSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec(session)?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        std::io::Write::write_all(&mut file, &content)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}
