//! panel-core: Shared protocol library for the game-server panel.
//!
//! Provides the console stream wire messages, the error taxonomy shared by
//! server and client, session token minting, secret hashing, and file names
//! for per-process state.

pub mod error;
pub mod messages;
pub mod naming;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{PanelError, PanelResult};
pub use messages::{AuthStatus, LogEntry, LoginRequest, ProcessInfo, ServerMessage};
pub use naming::file_stem;
pub use token::{generate_token, hash_secret, hash_secret_with, verify_secret, TOKEN_BYTES};
