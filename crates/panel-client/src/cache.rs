//! Local persistence of reconciled console views.
//!
//! A cached view lets a new connection resume from the last sequence number
//! the client held instead of replaying from zero.

use crate::reconciler::ReconcilerState;
use panel_core::{file_stem, PanelError, PanelResult};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// Boxed future returned by cache operations.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = PanelResult<T>> + Send + 'a>>;

/// Storage for per-process reconciler state.
pub trait ReconcilerCache: Send + Sync {
    fn load<'a>(&'a self, process_id: &'a str) -> CacheFuture<'a, Option<ReconcilerState>>;
    fn store<'a>(&'a self, process_id: &'a str, state: &'a ReconcilerState) -> CacheFuture<'a, ()>;
}

/// Keeps state for the lifetime of the client process.
#[derive(Debug, Default)]
pub struct MemoryCache {
    states: Mutex<HashMap<String, ReconcilerState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconcilerCache for MemoryCache {
    fn load<'a>(&'a self, process_id: &'a str) -> CacheFuture<'a, Option<ReconcilerState>> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.get(process_id).cloned();
        Box::pin(async move { Ok(state) })
    }

    fn store<'a>(&'a self, process_id: &'a str, state: &'a ReconcilerState) -> CacheFuture<'a, ()> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.insert(process_id.to_string(), state.clone());
        Box::pin(async { Ok(()) })
    }
}

/// One JSON file per process under a directory (default `~/.panel/console`).
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_location() -> PanelResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| PanelError::Other("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".panel").join("console")))
    }

    fn path_for(&self, process_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(process_id)))
    }
}

impl ReconcilerCache for FileCache {
    fn load<'a>(&'a self, process_id: &'a str) -> CacheFuture<'a, Option<ReconcilerState>> {
        Box::pin(async move {
            let path = self.path_for(process_id);
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice(&content) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring corrupt console cache");
                    Ok(None)
                }
            }
        })
    }

    fn store<'a>(&'a self, process_id: &'a str, state: &'a ReconcilerState) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let content = serde_json::to_vec(state)?;
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.path_for(process_id);
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, content).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }
}
