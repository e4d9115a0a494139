//! Console stream gateway: one WebSocket connection bound to one process.
//!
//! The snapshot is always the first frame. After it, a downstream task relays
//! live entries and an upstream task turns inbound text frames into process
//! input. Whichever task ends first cancels the other, then the viewer is
//! unsubscribed exactly once.
//!
//! Commands are forwarded by a separate task fed through a bounded queue, so
//! a process that stops reading its input never stalls frame reading or
//! teardown.

use crate::console::{ConsoleHub, Subscription};
use crate::http::AppState;
use crate::process::ProcessManager;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use panel_core::{LogEntry, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands a viewer may have waiting for delivery.
const COMMAND_QUEUE: usize = 32;

/// Longest a single command may wait on process input.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the second task gets to notice cancellation before it is aborted.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Who is attached to what, and where they want to resume.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub process_id: String,
    pub identity: String,
    pub last_seq: u64,
}

/// Drive one console connection until either side goes away.
pub async fn serve_console(socket: WebSocket, state: AppState, target: StreamTarget) {
    let Subscription {
        snapshot,
        reset,
        receiver,
        mut guard,
    } = state.hub.subscribe(&target.process_id, target.last_seq);

    info!(
        process_id = %target.process_id,
        identity = %target.identity,
        last_seq = target.last_seq,
        reset,
        entries = snapshot.len(),
        "console attached"
    );

    let (mut sink, stream) = socket.split();

    let first = match ServerMessage::snapshot(snapshot, reset).to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(process_id = %target.process_id, error = %e, "failed to encode snapshot");
            guard.unsubscribe();
            return;
        }
    };
    if let Err(e) = sink.send(Message::Text(first.into())).await {
        debug!(process_id = %target.process_id, error = %e, "viewer left before snapshot");
        guard.unsubscribe();
        return;
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut downstream = tokio::spawn(downstream(
        sink,
        receiver,
        state.shutdown_tx.subscribe(),
        cancel_rx.clone(),
        target.process_id.clone(),
    ));
    let mut upstream = tokio::spawn(upstream(
        stream,
        state.hub.clone(),
        state.processes.clone(),
        cancel_rx,
        target.clone(),
    ));

    tokio::select! {
        result = &mut downstream => {
            let _ = cancel_tx.send(true);
            if let Err(e) = result {
                warn!(process_id = %target.process_id, error = %e, "downstream task failed");
            }
            finish(upstream, &target.process_id).await;
        }
        result = &mut upstream => {
            let _ = cancel_tx.send(true);
            if let Err(e) = result {
                warn!(process_id = %target.process_id, error = %e, "upstream task failed");
            }
            finish(downstream, &target.process_id).await;
        }
    }

    guard.unsubscribe();
    info!(
        process_id = %target.process_id,
        identity = %target.identity,
        "console detached"
    );
}

/// Live entries → `log` frames.
async fn downstream(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<LogEntry>,
    mut shutdown: broadcast::Receiver<()>,
    mut cancel: watch::Receiver<bool>,
    process_id: String,
) {
    loop {
        tokio::select! {
            entry = receiver.recv() => {
                let Some(entry) = entry else {
                    // The hub let go of this viewer (queue overflow).
                    debug!(process_id = %process_id, "live channel closed");
                    close(&mut sink, close_code::AGAIN, "viewer fell behind").await;
                    break;
                };
                let json = match ServerMessage::log(entry).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(process_id = %process_id, error = %e, "failed to encode log entry");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    debug!(process_id = %process_id, error = %e, "console write failed");
                    break;
                }
            }
            _ = shutdown.recv() => {
                debug!(process_id = %process_id, "shutdown signal received, closing console");
                close(&mut sink, close_code::AWAY, "server shutdown").await;
                break;
            }
            _ = cancel.changed() => break,
        }
    }
}

/// Give a task a moment to wind down after cancellation, then abort it.
async fn finish(mut task: JoinHandle<()>, process_id: &str) {
    if tokio::time::timeout(TEARDOWN_GRACE, &mut task).await.is_err() {
        warn!(process_id, "console task did not stop, aborting");
        task.abort();
    }
}

/// Inbound text frames → queued commands.
async fn upstream(
    mut stream: SplitStream<WebSocket>,
    hub: ConsoleHub,
    processes: Arc<dyn ProcessManager>,
    mut cancel: watch::Receiver<bool>,
    target: StreamTarget,
) {
    let (commands, queue) = mpsc::channel(COMMAND_QUEUE);
    // Detached: commands already accepted are still delivered after the
    // viewer leaves, each bounded by COMMAND_TIMEOUT.
    tokio::spawn(forward_commands(queue, hub, processes, target.clone()));

    loop {
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => text.to_owned(),
                        Err(_) => {
                            debug!(process_id = %target.process_id, "ignoring non-UTF-8 frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(process_id = %target.process_id, "viewer closed the stream");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(process_id = %target.process_id, error = %e, "console read failed");
                        break;
                    }
                };
                match commands.try_send(text) {
                    Ok(()) => {}
                    Err(TrySendError::Full(text)) => {
                        warn!(
                            process_id = %target.process_id,
                            identity = %target.identity,
                            command = text.trim(),
                            "command queue full, command dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            _ = cancel.changed() => break,
        }
    }
}

/// Deliver queued commands in order until the queue is closed and drained.
async fn forward_commands(
    mut queue: mpsc::Receiver<String>,
    hub: ConsoleHub,
    processes: Arc<dyn ProcessManager>,
    target: StreamTarget,
) {
    while let Some(raw) = queue.recv().await {
        run_command(&hub, processes.as_ref(), &target, &raw).await;
    }
}

/// Forward one command and record it. Neither step can end the connection.
async fn run_command(
    hub: &ConsoleHub,
    processes: &dyn ProcessManager,
    target: &StreamTarget,
    raw: &str,
) {
    let command = raw.trim();
    if command.is_empty() {
        return;
    }

    info!(
        process_id = %target.process_id,
        identity = %target.identity,
        command,
        "console command"
    );
    match tokio::time::timeout(
        COMMAND_TIMEOUT,
        processes.send_input(&target.process_id, command),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(process_id = %target.process_id, error = %e, "command not delivered");
        }
        Err(_) => {
            warn!(process_id = %target.process_id, "command delivery timed out");
        }
    }
    hub.append(&target.process_id, format!("> {command}"));
}

async fn close(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use panel_core::{PanelError, PanelResult, ProcessInfo};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProcesses {
        inputs: Mutex<Vec<String>>,
        fail: bool,
    }

    impl ProcessManager for RecordingProcesses {
        fn exists(&self, id: &str) -> bool {
            id == "alpha"
        }

        fn list(&self) -> Vec<ProcessInfo> {
            Vec::new()
        }

        fn send_input<'a>(
            &'a self,
            _id: &'a str,
            text: &'a str,
        ) -> Pin<Box<dyn Future<Output = PanelResult<()>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail {
                    return Err(PanelError::Delivery("process is not running".into()));
                }
                self.inputs.lock().unwrap().push(text.to_string());
                Ok(())
            })
        }
    }

    fn target() -> StreamTarget {
        StreamTarget {
            process_id: "alpha".into(),
            identity: "admin".into(),
            last_seq: 0,
        }
    }

    #[tokio::test]
    async fn command_is_trimmed_forwarded_and_echoed() {
        let hub = ConsoleHub::new(10, 4);
        let processes = RecordingProcesses::default();
        run_command(&hub, &processes, &target(), "  say hi \n").await;

        assert_eq!(*processes.inputs.lock().unwrap(), vec!["say hi".to_string()]);
        let sub = hub.subscribe("alpha", 0);
        assert_eq!(sub.snapshot, vec![LogEntry::new(1, "> say hi")]);
    }

    #[tokio::test]
    async fn blank_command_is_ignored() {
        let hub = ConsoleHub::new(10, 4);
        let processes = RecordingProcesses::default();
        run_command(&hub, &processes, &target(), "   ").await;

        assert!(processes.inputs.lock().unwrap().is_empty());
        assert_eq!(hub.newest_seq("alpha"), 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_still_recorded() {
        let hub = ConsoleHub::new(10, 4);
        let processes = RecordingProcesses {
            fail: true,
            ..Default::default()
        };
        run_command(&hub, &processes, &target(), "stop").await;
        assert_eq!(hub.newest_seq("alpha"), 1);
    }

    struct StuckProcesses;

    impl ProcessManager for StuckProcesses {
        fn exists(&self, _id: &str) -> bool {
            true
        }

        fn list(&self) -> Vec<ProcessInfo> {
            Vec::new()
        }

        fn send_input<'a>(
            &'a self,
            _id: &'a str,
            _text: &'a str,
        ) -> Pin<Box<dyn Future<Output = PanelResult<()>> + Send + 'a>> {
            Box::pin(std::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_delivery_times_out_and_is_still_recorded() {
        let hub = ConsoleHub::new(10, 4);
        run_command(&hub, &StuckProcesses, &target(), "save-all").await;
        let sub = hub.subscribe("alpha", 0);
        assert_eq!(sub.snapshot, vec![LogEntry::new(1, "> save-all")]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_task_is_aborted_after_the_grace_period() {
        let task = tokio::spawn(std::future::pending::<()>());
        let started = tokio::time::Instant::now();
        finish(task, "alpha").await;
        assert_eq!(started.elapsed(), TEARDOWN_GRACE);
    }
}
