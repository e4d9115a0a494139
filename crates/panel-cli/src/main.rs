//! panel: game-server panel CLI.
//!
//! Logs in to a panel server, lists managed processes, and attaches to live
//! consoles with transparent reconnect.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::Settings;
use config::{Config, SessionFile};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// panel: game-server panel client
#[derive(Parser)]
#[command(name = "panel", version, about = "Game-server panel client")]
struct Cli {
    /// Panel base URL (overrides config)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and save the session
    Login {
        /// Login name (defaults to config, else prompts)
        username: Option<String>,
        /// Read the password from the first line of stdin
        #[arg(long)]
        password_stdin: bool,
    },

    /// Revoke the saved session
    Logout,

    /// Show who the saved session belongs to
    Whoami,

    /// List managed processes
    Servers,

    /// Follow a process console; stdin lines are sent as commands
    Attach {
        /// Process id
        process: String,
        /// Keep the reconciled view in memory only
        #[arg(long)]
        no_cache: bool,
    },

    /// Print the Argon2id hash of a password for `[auth.users]`
    HashPassword {
        /// Read the password from the first line of stdin
        #[arg(long)]
        stdin: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "panel=debug,panel_cli=debug,panel_client=debug,panel_core=debug"
    } else {
        "panel=warn,panel_cli=warn,panel_client=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("panel: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = || load_settings(cli.url.as_deref(), cli.config.as_deref());

    match cli.command {
        Command::HashPassword { stdin } => commands::hash_password::run(stdin),
        Command::Login {
            username,
            password_stdin,
        } => commands::login::run(&settings()?, username, password_stdin).await,
        Command::Logout => commands::logout::run(&settings()?).await,
        Command::Whoami => commands::whoami::run(&settings()?).await,
        Command::Servers => commands::servers::run(&settings()?).await,
        Command::Attach { process, no_cache } => {
            commands::attach::run(&settings()?, &process, no_cache).await
        }
    }
}

/// Merge the config file with CLI flags.
fn load_settings(url: Option<&str>, config_file: Option<&str>) -> anyhow::Result<Settings> {
    let config_path = match config_file {
        Some(path) => PathBuf::from(path),
        None => config::panel_dir()?.join("config.toml"),
    };
    let cfg = Config::load(&config_path)?;

    let url = url.map(str::to_string).unwrap_or(cfg.default.url);
    Ok(Settings {
        url: url.trim_end_matches('/').to_string(),
        username: Some(cfg.default.username).filter(|u| !u.is_empty()),
        cookie_name: cfg.default.cookie_name,
        session: SessionFile::default_location()?,
    })
}
