//! The panel client.
//!
//! `ConsoleClient` talks to the login/session endpoints over HTTP and keeps a
//! session cookie. [`ConsoleClient::attach`] opens a console stream that
//! reconnects on its own, resuming from the highest sequence number the local
//! reconciler holds.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderValue, COOKIE, RETRY_AFTER, SET_COOKIE};
use reqwest::{RequestBuilder, StatusCode, Url};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use panel_core::{
    AuthStatus, LogEntry, LoginRequest, PanelError, PanelResult, ProcessInfo, ServerMessage,
};

use crate::cache::ReconcilerCache;
use crate::reconciler::ClientReconciler;

/// First reconnect delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect delays double up to this.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

/// Live lines merged before the cached view is rewritten.
const STORE_EVERY: usize = 100;
/// Longest a merged line waits before the cached view is rewritten.
const STORE_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for a panel client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Panel base URL, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Name of the session cookie set by the server.
    pub cookie_name: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            cookie_name: "panel_session".to_string(),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// What an attached console reports.
#[derive(Debug)]
pub enum ConsoleEvent {
    /// A snapshot was applied; `view` is the whole reconciled log.
    Snapshot { view: Vec<LogEntry>, reset: bool },
    /// A new entry was merged.
    Line(LogEntry),
    /// The stream dropped; the next attempt starts after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The stream ended for good. `None` means it was closed locally.
    Closed(Option<PanelError>),
}

/// HTTP + console client for one panel server.
pub struct ConsoleClient {
    http: reqwest::Client,
    base: Url,
    cookie_name: String,
    initial_backoff: Duration,
    max_backoff: Duration,
    token: Option<String>,
}

impl ConsoleClient {
    pub fn new(config: ClientConfig) -> PanelResult<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            PanelError::Config(format!("invalid server url '{}': {e}", config.base_url))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(PanelError::Config(format!(
                "server url must be http or https: {}",
                config.base_url
            )));
        }
        let http = reqwest::Client::builder().build().map_err(transport)?;
        Ok(Self {
            http,
            base,
            cookie_name: config.cookie_name,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            token: None,
        })
    }

    /// Reuse a session token obtained earlier.
    pub fn with_session(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn session_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Log in and keep the session cookie for later requests.
    pub async fn login(&mut self, username: &str, password: &str) -> PanelResult<AuthStatus> {
        let url = self.endpoint(&["api", "login"])?;
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        match resp.status() {
            StatusCode::OK => {
                let token = resp
                    .headers()
                    .get_all(SET_COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .find_map(|v| cookie_value(v, &self.cookie_name))
                    .ok_or_else(|| {
                        PanelError::InvalidMessage("login response carried no session cookie".into())
                    })?;
                let status: AuthStatus = resp.json().await.map_err(transport)?;
                info!(identity = ?status.identity, "logged in");
                self.token = Some(token);
                Ok(status)
            }
            StatusCode::UNAUTHORIZED => Err(PanelError::Unauthorized("invalid credentials".into())),
            StatusCode::TOO_MANY_REQUESTS => Err(rate_limited(resp).await),
            other => Err(unexpected(other)),
        }
    }

    /// Revoke the session server-side and forget it locally.
    pub async fn logout(&mut self) -> PanelResult<()> {
        let url = self.endpoint(&["api", "logout"])?;
        let resp = self
            .with_cookie(self.http.post(url))
            .send()
            .await
            .map_err(transport)?;
        self.token = None;
        if !resp.status().is_success() {
            return Err(unexpected(resp.status()));
        }
        Ok(())
    }

    /// Ask the server who the current session belongs to.
    pub async fn session(&self) -> PanelResult<AuthStatus> {
        let url = self.endpoint(&["api", "session"])?;
        let resp = self
            .with_cookie(self.http.get(url))
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(unexpected(resp.status()));
        }
        resp.json().await.map_err(transport)
    }

    /// List the managed processes.
    pub async fn servers(&self) -> PanelResult<Vec<ProcessInfo>> {
        let url = self.endpoint(&["api", "servers"])?;
        let resp = self
            .with_cookie(self.http.get(url))
            .send()
            .await
            .map_err(transport)?;
        match resp.status() {
            StatusCode::OK => resp.json().await.map_err(transport),
            StatusCode::UNAUTHORIZED => Err(PanelError::Unauthorized("not logged in".into())),
            other => Err(unexpected(other)),
        }
    }

    /// Attach to a process console. The returned handle yields events and
    /// accepts commands; the stream reconnects until closed or rejected.
    pub fn attach(
        &self,
        process_id: &str,
        cache: Arc<dyn ReconcilerCache>,
    ) -> PanelResult<ConsoleHandle> {
        let mut url = self.endpoint(&["api", "servers", process_id, "console"])?;
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| PanelError::Config(format!("cannot derive console url from {url}")))?;

        let stream = StreamConfig {
            url,
            cookie: self.token.as_ref().map(|t| format!("{}={t}", self.cookie_name)),
            process_id: process_id.to_string(),
            cache,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_console(stream, command_rx, event_tx, stop_rx));

        Ok(ConsoleHandle {
            commands: command_tx,
            events: event_rx,
            stop: stop_tx,
            task,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> PanelResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PanelError::Config(format!("server url cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn with_cookie(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(COOKIE, format!("{}={token}", self.cookie_name)),
            None => request,
        }
    }
}

/// A live console attachment.
pub struct ConsoleHandle {
    commands: mpsc::Sender<String>,
    events: mpsc::Receiver<ConsoleEvent>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsoleHandle {
    /// Queue a command. Commands typed while reconnecting are sent once the
    /// stream is back.
    pub async fn send(&self, command: impl Into<String>) -> PanelResult<()> {
        self.commands
            .send(command.into())
            .await
            .map_err(|_| PanelError::Transport("console closed".into()))
    }

    pub async fn next_event(&mut self) -> Option<ConsoleEvent> {
        self.events.recv().await
    }

    /// Close the stream and wait for the background task.
    pub async fn close(self) {
        let ConsoleHandle {
            commands,
            events,
            stop,
            task,
        } = self;
        drop(events);
        drop(commands);
        let _ = stop.send(true);
        let _ = task.await;
    }
}

struct StreamConfig {
    url: Url,
    cookie: Option<String>,
    process_id: String,
    cache: Arc<dyn ReconcilerCache>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

enum StreamEnd {
    /// Closed locally.
    Stopped,
    /// Retrying cannot help.
    Fatal(PanelError),
    /// Transport lost; `streamed` tells whether any frame arrived.
    Lost { streamed: bool },
}

/// Live lines merged since the cached view was last written.
#[derive(Debug, Default)]
struct PendingStore {
    lines: usize,
    since: Option<Instant>,
}

impl PendingStore {
    fn note_line(&mut self) {
        self.lines += 1;
        self.since.get_or_insert_with(Instant::now);
    }

    fn is_dirty(&self) -> bool {
        self.lines > 0
    }

    fn deadline(&self) -> Option<Instant> {
        self.since.map(|since| since + STORE_INTERVAL)
    }

    fn is_due(&self) -> bool {
        self.lines >= STORE_EVERY || self.deadline().is_some_and(|at| Instant::now() >= at)
    }
}

/// Write the reconciled view to the cache and clear the pending count.
async fn persist(
    config: &StreamConfig,
    reconciler: &ClientReconciler,
    pending: &mut PendingStore,
) {
    *pending = PendingStore::default();
    if let Err(e) = config
        .cache
        .store(&config.process_id, &reconciler.state())
        .await
    {
        warn!(process_id = %config.process_id, error = %e, "failed to cache console view");
    }
}

async fn run_console(
    config: StreamConfig,
    mut commands: mpsc::Receiver<String>,
    events: mpsc::Sender<ConsoleEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut reconciler = match config.cache.load(&config.process_id).await {
        Ok(Some(state)) => ClientReconciler::from_state(state),
        Ok(None) => ClientReconciler::new(),
        Err(e) => {
            warn!(process_id = %config.process_id, error = %e, "console cache unreadable");
            ClientReconciler::new()
        }
    };

    let mut delay = config.initial_backoff;
    let mut attempt: u32 = 0;
    let mut pending = PendingStore::default();

    let reason = loop {
        let end = stream_once(
            &config,
            &mut reconciler,
            &mut pending,
            &mut commands,
            &events,
            &mut stop,
        )
        .await;
        if pending.is_dirty() {
            persist(&config, &reconciler, &mut pending).await;
        }
        match end {
            StreamEnd::Stopped => break None,
            StreamEnd::Fatal(e) => break Some(e),
            StreamEnd::Lost { streamed } => {
                if streamed {
                    delay = config.initial_backoff;
                    attempt = 0;
                }
                attempt += 1;
                info!(
                    process_id = %config.process_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    last_seq = reconciler.last_seq(),
                    "console connection lost, reconnecting"
                );
                if events
                    .send(ConsoleEvent::Reconnecting { attempt, delay })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => break None,
                }
                delay = next_backoff(delay, config.max_backoff);
            }
        }
    };

    let _ = events.send(ConsoleEvent::Closed(reason)).await;
}

/// One connection: handshake, then frames until something ends it.
async fn stream_once(
    config: &StreamConfig,
    reconciler: &mut ClientReconciler,
    pending: &mut PendingStore,
    commands: &mut mpsc::Receiver<String>,
    events: &mpsc::Sender<ConsoleEvent>,
    stop: &mut watch::Receiver<bool>,
) -> StreamEnd {
    let mut url = config.url.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("lastSeq", &reconciler.last_seq().to_string());

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => return StreamEnd::Fatal(PanelError::Config(format!("invalid console url: {e}"))),
    };
    if let Some(cookie) = &config.cookie {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                request.headers_mut().insert(COOKIE, value);
            }
            Err(e) => {
                return StreamEnd::Fatal(PanelError::Config(format!("invalid session cookie: {e}")))
            }
        }
    }

    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status();
            return match status {
                StatusCode::UNAUTHORIZED => {
                    StreamEnd::Fatal(PanelError::Unauthorized("session rejected".into()))
                }
                StatusCode::NOT_FOUND => StreamEnd::Fatal(PanelError::NotFound(format!(
                    "process {}",
                    config.process_id
                ))),
                _ => {
                    warn!(process_id = %config.process_id, %status, "console handshake refused");
                    StreamEnd::Lost { streamed: false }
                }
            };
        }
        Err(e) => {
            debug!(process_id = %config.process_id, error = %e, "console connect failed");
            return StreamEnd::Lost { streamed: false };
        }
    };
    debug!(process_id = %config.process_id, url = %url, "console connected");

    let (mut sink, mut stream) = ws.split();
    let mut streamed = false;

    loop {
        let store_at = pending.deadline();
        tokio::select! {
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        debug!(process_id = %config.process_id, ?frame, "console closed by server");
                        return StreamEnd::Lost { streamed };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(process_id = %config.process_id, error = %e, "console read failed");
                        return StreamEnd::Lost { streamed };
                    }
                    None => return StreamEnd::Lost { streamed },
                };
                let message = match ServerMessage::from_json(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(process_id = %config.process_id, error = %e, "ignoring console frame");
                        continue;
                    }
                };
                streamed = true;
                if !apply(config, reconciler, pending, message, events).await {
                    return StreamEnd::Stopped;
                }
            }
            _ = tokio::time::sleep_until(store_at.unwrap_or_else(Instant::now)), if store_at.is_some() => {
                persist(config, reconciler, pending).await;
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = sink.close().await;
                    return StreamEnd::Stopped;
                };
                if let Err(e) = sink.send(Message::Text(command)).await {
                    debug!(process_id = %config.process_id, error = %e, "console write failed");
                    return StreamEnd::Lost { streamed };
                }
            }
            _ = stop.changed() => {
                let _ = sink.close().await;
                return StreamEnd::Stopped;
            }
        }
    }
}

/// Merge a server message, persist when due, and report. Snapshots are
/// stored at once; live lines are coalesced. Returns `false` once nobody is
/// listening.
async fn apply(
    config: &StreamConfig,
    reconciler: &mut ClientReconciler,
    pending: &mut PendingStore,
    message: ServerMessage,
    events: &mpsc::Sender<ConsoleEvent>,
) -> bool {
    let event = match message {
        ServerMessage::Snapshot { entries, reset } => {
            reconciler.on_snapshot(entries, reset);
            persist(config, reconciler, pending).await;
            ConsoleEvent::Snapshot {
                view: reconciler.entries().to_vec(),
                reset,
            }
        }
        ServerMessage::Log { seq, line } => {
            let entry = LogEntry::new(seq, line);
            if !reconciler.on_log(entry.clone()) {
                return true;
            }
            pending.note_line();
            if pending.is_due() {
                persist(config, reconciler, pending).await;
            }
            ConsoleEvent::Line(entry)
        }
    };

    events.send(event).await.is_ok()
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Value of cookie `name` in a `Set-Cookie` header, if it is that cookie.
fn cookie_value(set_cookie: &str, name: &str) -> Option<String> {
    let pair = set_cookie.split(';').next()?;
    let (key, value) = pair.trim().split_once('=')?;
    (key == name && !value.is_empty()).then(|| value.to_string())
}

async fn rate_limited(resp: reqwest::Response) -> PanelError {
    let header = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let secs = match header {
        Some(secs) => secs,
        None => resp
            .json::<AuthStatus>()
            .await
            .ok()
            .and_then(|status| status.retry_after)
            .unwrap_or(1),
    };
    PanelError::RateLimited {
        retry_after: Duration::from_secs(secs.max(1)),
    }
}

fn unexpected(status: StatusCode) -> PanelError {
    PanelError::Transport(format!("unexpected response status {status}"))
}

fn transport(e: reqwest::Error) -> PanelError {
    PanelError::Transport(e.to_string())
}
