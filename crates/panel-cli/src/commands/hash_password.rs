//! `panel hash-password`: print the value to put in `[auth.users]`.

use anyhow::{Context, Result};
use dialoguer::Password;
use std::io::BufRead;

pub fn run(from_stdin: bool) -> Result<()> {
    let password = if from_stdin {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read password from stdin")?;
        line.trim_end_matches(['\n', '\r']).to_string()
    } else {
        Password::new()
            .with_prompt("Password")
            .with_confirmation("Repeat password", "passwords do not match")
            .interact()
            .context("failed to read password")?
    };

    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }

    let hash = panel_core::hash_secret(&password).context("failed to hash password")?;
    println!("{hash}");
    Ok(())
}
