//! CLI subcommand implementations.

pub mod attach;
pub mod hash_password;
pub mod login;
pub mod logout;
pub mod servers;
pub mod whoami;

use crate::config::SessionFile;
use anyhow::{Context, Result};
use panel_client::{ClientConfig, ConsoleClient};

/// Effective connection settings (config file + CLI flags).
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    pub username: Option<String>,
    pub cookie_name: String,
    pub session: SessionFile,
}

impl Settings {
    /// A client without a session.
    pub fn client(&self) -> Result<ConsoleClient> {
        ConsoleClient::new(ClientConfig {
            base_url: self.url.clone(),
            cookie_name: self.cookie_name.clone(),
            ..Default::default()
        })
        .with_context(|| format!("invalid panel url '{}'", self.url))
    }

    /// A client carrying the saved session; fails if there is none.
    pub fn logged_in_client(&self) -> Result<ConsoleClient> {
        let token = self
            .session
            .load(&self.url)?
            .with_context(|| format!("not logged in to {}; run `panel login` first", self.url))?;
        Ok(self.client()?.with_session(token))
    }
}
