//! panel-client: Rust client library for the game-server panel.
//!
//! Logs in over HTTP, keeps the session cookie, and attaches to process
//! consoles. An attached console reconciles snapshots and live entries into
//! one ordered view and survives reconnects without loss or duplication.
//!
//! # Quick Start
//!
//! ```no_run
//! use panel_client::{ClientConfig, ConsoleClient, ConsoleEvent, MemoryCache};
//! use std::sync::Arc;
//!
//! # async fn example() -> panel_core::PanelResult<()> {
//! let mut client = ConsoleClient::new(ClientConfig {
//!     base_url: "http://127.0.0.1:8080".into(),
//!     ..Default::default()
//! })?;
//! client.login("admin", "hunter2").await?;
//!
//! let mut console = client.attach("survival", Arc::new(MemoryCache::new()))?;
//! console.send("list").await?;
//! while let Some(event) = console.next_event().await {
//!     if let ConsoleEvent::Line(entry) = event {
//!         println!("{}", entry.line);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod reconciler;

// Re-export primary public types.
pub use cache::{CacheFuture, FileCache, MemoryCache, ReconcilerCache};
pub use client::{ClientConfig, ConsoleClient, ConsoleEvent, ConsoleHandle};
pub use reconciler::{ClientReconciler, ReconcilerState};

// Re-export panel-core error types for convenience.
pub use panel_core::{PanelError, PanelResult};
