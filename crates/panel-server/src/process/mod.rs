//! Process-management collaborator.
//!
//! The console engine only needs to know whether a process exists and how to
//! write a command to it; output reaches the console through
//! [`crate::console::ConsoleHub::append`], fed by the manager.

pub mod local;

pub use local::LocalProcessManager;

use panel_core::{PanelResult, ProcessInfo};
use std::future::Future;
use std::pin::Pin;

/// Narrow interface onto whatever supervises the game-server processes.
pub trait ProcessManager: Send + Sync {
    /// Whether `id` names a managed process record.
    fn exists(&self, id: &str) -> bool;

    /// All managed processes.
    fn list(&self) -> Vec<ProcessInfo>;

    /// Write one command line to the process input.
    fn send_input<'a>(
        &'a self,
        id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = PanelResult<()>> + Send + 'a>>;
}
