//! Child processes launched from `[[process]]` config entries.
//!
//! Stdout and stderr are read line by line and appended to the console hub.
//! Commands go through a bounded queue to a per-process stdin writer, so a
//! process that stops reading its input fills the queue and rejects further
//! commands instead of blocking callers. Restart policy is someone else's
//! job: an exited process simply stops producing lines and rejects input.

use super::ProcessManager;
use crate::console::ConsoleHub;
use panel_core::{PanelError, PanelResult, ProcessInfo};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// Commands waiting for a process to read its input.
const INPUT_QUEUE: usize = 64;

/// One `[[process]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSpec {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

struct ManagedProcess {
    spec: ProcessSpec,
    input: Mutex<Option<mpsc::Sender<String>>>,
    running: AtomicBool,
}

impl ManagedProcess {
    fn input(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.input.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawns and tracks the configured processes.
pub struct LocalProcessManager {
    processes: HashMap<String, Arc<ManagedProcess>>,
    hub: ConsoleHub,
}

impl LocalProcessManager {
    pub fn new(specs: Vec<ProcessSpec>, hub: ConsoleHub) -> Self {
        let processes = specs
            .into_iter()
            .map(|spec| {
                let id = spec.id.clone();
                let process = Arc::new(ManagedProcess {
                    spec,
                    input: Mutex::new(None),
                    running: AtomicBool::new(false),
                });
                (id, process)
            })
            .collect();
        Self { processes, hub }
    }

    /// Ids of every configured process.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Launch every configured process. Returns how many started.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for process in self.processes.values() {
            match self.spawn(process).await {
                Ok(()) => started += 1,
                Err(e) => {
                    error!(process_id = %process.spec.id, error = %e, "failed to start process");
                }
            }
        }
        started
    }

    async fn spawn(&self, process: &Arc<ManagedProcess>) -> PanelResult<()> {
        let spec = &process.spec;
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            PanelError::Other(format!("failed to spawn '{}': {e}", spec.command))
        })?;

        if let Some(stdin) = child.stdin.take() {
            let (tx, rx) = mpsc::channel(INPUT_QUEUE);
            tokio::spawn(pump_input(stdin, rx, spec.id.clone()));
            *process.input() = Some(tx);
        }
        process.running.store(true, Ordering::SeqCst);
        info!(process_id = %spec.id, pid = child.id().unwrap_or(0), "process started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, spec.id.clone(), self.hub.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, spec.id.clone(), self.hub.clone()));
        }

        let process = process.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(process_id = %process.spec.id, %status, "process exited"),
                Err(e) => warn!(process_id = %process.spec.id, error = %e, "wait failed"),
            }
            process.running.store(false, Ordering::SeqCst);
            process.input().take();
        });

        Ok(())
    }
}

/// Forward every line of `reader` into the console of `process_id`.
async fn pump_lines<R>(reader: R, process_id: String, hub: ConsoleHub)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                hub.append(&process_id, line);
            }
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "process output read failed");
                break;
            }
        }
    }
    debug!(process_id = %process_id, "process output closed");
}

/// Write queued commands, one per line, until the queue closes or the pipe
/// breaks.
async fn pump_input(mut stdin: ChildStdin, mut queue: mpsc::Receiver<String>, process_id: String) {
    while let Some(text) = queue.recv().await {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');
        let written = match stdin.write_all(&data).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(process_id = %process_id, error = %e, "process input write failed");
            break;
        }
    }
    debug!(process_id = %process_id, "process input closed");
}

impl ProcessManager for LocalProcessManager {
    fn exists(&self, id: &str) -> bool {
        self.processes.contains_key(id)
    }

    fn list(&self) -> Vec<ProcessInfo> {
        self.ids()
            .into_iter()
            .map(|id| {
                let running = self.processes[&id].running.load(Ordering::SeqCst);
                ProcessInfo { id, running }
            })
            .collect()
    }

    fn send_input<'a>(
        &'a self,
        id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = PanelResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let process = self
                .processes
                .get(id)
                .ok_or_else(|| PanelError::NotFound(id.to_string()))?;

            let input = process.input();
            let queue = input
                .as_ref()
                .ok_or_else(|| PanelError::Delivery(format!("process {id} is not running")))?;
            match queue.try_send(text.to_string()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(PanelError::Delivery(format!(
                    "process {id} is not reading its input"
                ))),
                Err(TrySendError::Closed(_)) => {
                    Err(PanelError::Delivery(format!("process {id} input is closed")))
                }
            }
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(id: &str, command: &str, args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            id: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn output_and_input_flow_through_the_console() {
        let hub = ConsoleHub::new(100, 16);
        let manager = LocalProcessManager::new(
            vec![spec("echo", "sh", &["-c", "echo ready; cat"])],
            hub.clone(),
        );
        let mut sub = hub.subscribe("echo", 0);
        assert_eq!(manager.start_all().await, 1);

        let first = tokio::time::timeout(Duration::from_secs(5), sub.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.line, "ready");

        manager.send_input("echo", "say hello").await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), sub.receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.line, "say hello");
        assert_eq!(echoed.seq, 2);

        assert!(manager.list().iter().any(|p| p.id == "echo" && p.running));
    }

    #[tokio::test]
    async fn unknown_and_stopped_processes_reject_input() {
        let hub = ConsoleHub::new(100, 16);
        let manager = LocalProcessManager::new(vec![spec("idle", "true", &[])], hub);

        let err = manager.send_input("ghost", "stop").await.unwrap_err();
        assert!(matches!(err, PanelError::NotFound(_)));

        // Never started.
        let err = manager.send_input("idle", "stop").await.unwrap_err();
        assert!(err.is_transient());
        assert!(manager.exists("idle"));
        assert!(!manager.exists("ghost"));
    }

    #[tokio::test]
    async fn process_ignoring_input_rejects_commands_without_blocking() {
        let hub = ConsoleHub::new(100, 16);
        let manager = LocalProcessManager::new(vec![spec("deaf", "sleep", &["5"])], hub);
        assert_eq!(manager.start_all().await, 1);

        let command = "x".repeat(8 * 1024);
        let mut rejected = None;
        for _ in 0..(INPUT_QUEUE * 4) {
            let sent = tokio::time::timeout(
                Duration::from_secs(1),
                manager.send_input("deaf", &command),
            )
            .await
            .expect("send_input blocked on a full pipe");
            if let Err(e) = sent {
                rejected = Some(e);
                break;
            }
            tokio::task::yield_now().await;
        }
        let err = rejected.expect("input was never rejected");
        assert!(matches!(err, PanelError::Delivery(_)), "{err:?}");
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let hub = ConsoleHub::new(100, 16);
        let manager = LocalProcessManager::new(
            vec![spec("bad", "/definitely/not/a/binary", &[])],
            hub,
        );
        assert_eq!(manager.start_all().await, 0);
        assert_eq!(
            manager.list(),
            vec![ProcessInfo {
                id: "bad".into(),
                running: false
            }]
        );
    }
}
