//! `panel whoami`: show the identity behind the saved session.

use super::Settings;
use anyhow::{Context, Result};

pub async fn run(settings: &Settings) -> Result<()> {
    let client = settings.logged_in_client()?;
    let status = client.session().await.context("session check failed")?;
    match status.identity {
        Some(identity) if status.authenticated => println!("{identity} @ {}", settings.url),
        _ => {
            settings.session.clear()?;
            anyhow::bail!("session expired; run `panel login` again");
        }
    }
    Ok(())
}
