//! `panel attach <process>`: follow a live console and send commands.
//!
//! Console lines go to stdout. Each stdin line is sent as one command.
//! Connection notices go to stderr so the output stays pipeable.

use super::Settings;
use anyhow::{Context, Result};
use panel_client::{ConsoleEvent, FileCache, MemoryCache, ReconcilerCache};
use panel_core::LogEntry;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

pub async fn run(settings: &Settings, process_id: &str, no_cache: bool) -> Result<()> {
    let client = settings.logged_in_client()?;
    let cache: Arc<dyn ReconcilerCache> = if no_cache {
        Arc::new(MemoryCache::new())
    } else {
        Arc::new(FileCache::default_location().context("console cache unavailable")?)
    };

    let mut console = client
        .attach(process_id, cache)
        .with_context(|| format!("cannot attach to {process_id}"))?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut printed: u64 = 0;

    loop {
        tokio::select! {
            event = console.next_event() => match event {
                Some(ConsoleEvent::Snapshot { view, reset }) => {
                    if reset && printed > 0 {
                        eprintln!("--- console history reset ---");
                        printed = 0;
                    }
                    printed = print_after(&view, printed);
                }
                Some(ConsoleEvent::Line(entry)) => {
                    println!("{}", entry.line);
                    printed = printed.max(entry.seq);
                }
                Some(ConsoleEvent::Reconnecting { attempt, delay }) => {
                    eprintln!(
                        "--- connection lost, reconnecting in {}s (attempt {attempt}) ---",
                        delay.as_secs().max(1)
                    );
                }
                Some(ConsoleEvent::Closed(Some(e))) => {
                    return Err(e).with_context(|| format!("console for {process_id} closed"));
                }
                Some(ConsoleEvent::Closed(None)) | None => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(command)) => {
                    if !command.trim().is_empty() {
                        console.send(command).await?;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, following output only");
                    stdin_open = false;
                }
                Err(e) => return Err(e).context("failed to read stdin"),
            },
        }
    }

    console.close().await;
    Ok(())
}

/// Print entries newer than `printed`; returns the new high-water mark.
fn print_after(view: &[LogEntry], printed: u64) -> u64 {
    let mut high = printed;
    for entry in view.iter().filter(|e| e.seq > printed) {
        println!("{}", entry.line);
        high = entry.seq;
    }
    high
}
