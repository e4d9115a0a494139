//! `panel logout`: revoke the saved session.

use super::Settings;
use anyhow::Result;
use tracing::warn;

pub async fn run(settings: &Settings) -> Result<()> {
    let Some(token) = settings.session.load(&settings.url)? else {
        println!("Not logged in to {}", settings.url);
        return Ok(());
    };

    let mut client = settings.client()?.with_session(token);
    if let Err(e) = client.logout().await {
        // The local copy goes away regardless; the server expires it later.
        warn!(error = %e, "server-side logout failed");
    }
    settings.session.clear()?;
    println!("Logged out of {}", settings.url);
    Ok(())
}
