//! `panel login [username]`: open a session and save it.

use super::Settings;
use crate::config::SavedSession;
use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use panel_core::PanelError;
use std::io::BufRead;
use tracing::info;

pub async fn run(settings: &Settings, username: Option<String>, password_stdin: bool) -> Result<()> {
    let username = match username.or_else(|| settings.username.clone()) {
        Some(name) => name,
        None => Input::<String>::new()
            .with_prompt("Username")
            .interact_text()
            .context("failed to read username")?,
    };

    let password = if password_stdin {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read password from stdin")?;
        line.trim_end_matches(['\n', '\r']).to_string()
    } else {
        Password::new()
            .with_prompt(format!("Password for {username}"))
            .interact()
            .context("failed to read password")?
    };

    let mut client = settings.client()?;
    let status = match client.login(&username, &password).await {
        Ok(status) => status,
        Err(PanelError::RateLimited { retry_after }) => {
            anyhow::bail!(
                "too many failed logins from this address; retry in {}s",
                retry_after.as_secs()
            );
        }
        Err(PanelError::Unauthorized(_)) => anyhow::bail!("invalid username or password"),
        Err(e) => return Err(e).context("login failed"),
    };

    let token = client
        .session_token()
        .context("server did not return a session")?
        .to_string();
    settings.session.save(&SavedSession {
        url: settings.url.clone(),
        token,
    })?;

    let identity = status.identity.unwrap_or(username);
    info!(identity = %identity, url = %settings.url, "session saved");
    println!("Logged in to {} as {identity}", settings.url);
    Ok(())
}
