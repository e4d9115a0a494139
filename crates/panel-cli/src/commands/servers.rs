//! `panel servers`: list managed processes.

use super::Settings;
use anyhow::{Context, Result};
use panel_core::PanelError;

pub async fn run(settings: &Settings) -> Result<()> {
    let client = settings.logged_in_client()?;
    let servers = match client.servers().await {
        Ok(servers) => servers,
        Err(PanelError::Unauthorized(_)) => {
            anyhow::bail!("session expired; run `panel login` again")
        }
        Err(e) => return Err(e).context("failed to list servers"),
    };

    if servers.is_empty() {
        println!("(no managed processes)");
        return Ok(());
    }

    println!("{:<24} {}", "ID", "STATUS");
    for server in &servers {
        let status = if server.running { "running" } else { "stopped" };
        println!("{:<24} {status}", server.id);
    }
    Ok(())
}
