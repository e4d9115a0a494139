//! HTTP surface: login/logout/session endpoints, the process list, and the
//! upgradeable console endpoint.
//!
//! The session token travels only in a cookie. The console endpoint checks
//! the cookie and the process id before accepting the upgrade, so an
//! unauthenticated caller never causes a snapshot to be computed.

use crate::auth::{AuthService, LoginThrottle};
use crate::console::ConsoleHub;
use crate::gateway::{self, StreamTarget};
use crate::process::ProcessManager;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{COOKIE, RETRY_AFTER, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use panel_core::{AuthStatus, LoginRequest, PanelError};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};

/// How the session cookie is written.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub name: String,
    pub secure: bool,
    pub max_age: Duration,
}

impl CookieSettings {
    fn issue(&self, token: &str) -> String {
        self.build(token, self.max_age.as_secs())
    }

    fn clear(&self) -> String {
        self.build("", 0)
    }

    fn build(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!(
            "{}={value}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age}",
            self.name
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub hub: ConsoleHub,
    pub processes: Arc<dyn ProcessManager>,
    pub cookie: CookieSettings,
    /// Fired once on server shutdown; open consoles close on it.
    pub shutdown_tx: broadcast::Sender<()>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/session", get(session))
        .route("/api/servers", get(servers))
        .route("/api/servers/{id}/console", get(console))
        .with_state(state)
}

/// Query string of the console endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConsoleQuery {
    #[serde(rename = "lastSeq", alias = "last_seq")]
    pub last_seq: Option<u64>,
}

/// Maps the error taxonomy onto HTTP responses.
pub struct ApiError(pub PanelError);

impl From<PanelError> for ApiError {
    fn from(e: PanelError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            PanelError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "message": what })),
            )
                .into_response(),
            PanelError::Unauthorized(_) => {
                (StatusCode::UNAUTHORIZED, Json(AuthStatus::anonymous())).into_response()
            }
            PanelError::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(RETRY_AFTER, HeaderValue::from(secs))],
                    Json(AuthStatus::rate_limited(secs)),
                )
                    .into_response()
            }
            PanelError::InvalidMessage(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "bad_request", "message": message })),
            )
                .into_response(),
            other => {
                error!(error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal" })),
                )
                    .into_response()
            }
        }
    }
}

/// Read the session token out of the `Cookie` header(s).
fn session_token(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn set_cookie(cookie: String) -> Result<[(axum::http::HeaderName, HeaderValue); 1], ApiError> {
    let value = HeaderValue::try_from(cookie)
        .map_err(|e| PanelError::Other(format!("invalid cookie header: {e}")))?;
    Ok([(SET_COOKIE, value)])
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        body.map_err(|e| PanelError::InvalidMessage(format!("login body: {e}")))?;
    let source = LoginThrottle::key_for(&peer.ip());

    let token = state
        .auth
        .login(&source, &request.username, &request.password)
        .await?;

    let headers = set_cookie(state.cookie.issue(&token))?;
    Ok((headers, Json(AuthStatus::authenticated(request.username))).into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    if let Some(token) = session_token(&headers, &state.cookie.name) {
        state.auth.logout(&token).await;
    }
    let headers = set_cookie(state.cookie.clear())?;
    Ok((headers, Json(AuthStatus::anonymous())).into_response())
}

async fn session(State(state): State<AppState>, headers: HeaderMap) -> Json<AuthStatus> {
    let token = session_token(&headers, &state.cookie.name);
    match state.auth.authenticate(token.as_deref()).await {
        Ok(identity) => Json(AuthStatus::authenticated(identity)),
        Err(_) => Json(AuthStatus::anonymous()),
    }
}

async fn servers(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let token = session_token(&headers, &state.cookie.name);
    state.auth.authenticate(token.as_deref()).await?;
    Ok(Json(state.processes.list()).into_response())
}

async fn console(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
    Query(query): Query<ConsoleQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let token = session_token(&headers, &state.cookie.name);
    let identity = state.auth.authenticate(token.as_deref()).await?;

    if !state.processes.exists(&process_id) {
        debug!(process_id = %process_id, identity = %identity, "console for unknown process");
        return Err(PanelError::NotFound(format!("process {process_id}")).into());
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let target = StreamTarget {
        process_id,
        identity,
        last_seq: query.last_seq.unwrap_or(0),
    };
    Ok(upgrade.on_upgrade(move |socket| gateway::serve_console(socket, state, target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ConfigCredentials, SessionStore, ThrottlePolicy, DEFAULT_SESSION_TTL};
    use futures_util::{SinkExt, StreamExt};
    use panel_core::{hash_secret, PanelResult, ProcessInfo, ServerMessage};
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    #[derive(Default)]
    struct FakeProcesses {
        inputs: Mutex<Vec<(String, String)>>,
        /// Input never drains, like a process that stopped reading stdin.
        stuck: bool,
    }

    impl ProcessManager for FakeProcesses {
        fn exists(&self, id: &str) -> bool {
            id == "alpha" || id == "beta"
        }

        fn list(&self) -> Vec<ProcessInfo> {
            vec![
                ProcessInfo {
                    id: "alpha".into(),
                    running: true,
                },
                ProcessInfo {
                    id: "beta".into(),
                    running: false,
                },
            ]
        }

        fn send_input<'a>(
            &'a self,
            id: &'a str,
            text: &'a str,
        ) -> Pin<Box<dyn Future<Output = PanelResult<()>> + Send + 'a>> {
            Box::pin(async move {
                if self.stuck {
                    std::future::pending::<()>().await;
                }
                self.inputs
                    .lock()
                    .unwrap()
                    .push((id.to_string(), text.to_string()));
                Ok(())
            })
        }
    }

    struct Harness {
        addr: SocketAddr,
        state: AppState,
        processes: Arc<FakeProcesses>,
        http: reqwest::Client,
    }

    async fn start() -> Harness {
        start_with(FakeProcesses::default()).await
    }

    async fn start_with(processes: FakeProcesses) -> Harness {
        let mut users = HashMap::new();
        users.insert("admin".to_string(), hash_secret("hunter2").unwrap());
        let auth = AuthService::new(
            SessionStore::new(DEFAULT_SESSION_TTL),
            LoginThrottle::new(ThrottlePolicy {
                max_failures: 3,
                ..Default::default()
            }),
            Arc::new(ConfigCredentials::new(users)),
        );
        let processes = Arc::new(processes);
        let state = AppState {
            auth: Arc::new(auth),
            hub: ConsoleHub::new(100, 32),
            processes: processes.clone(),
            cookie: CookieSettings {
                name: "panel_session".into(),
                secure: false,
                max_age: DEFAULT_SESSION_TTL,
            },
            shutdown_tx: broadcast::channel(1).0,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Harness {
            addr,
            state,
            processes,
            http: reqwest::Client::new(),
        }
    }

    impl Harness {
        async fn login(&self, password: &str) -> reqwest::Response {
            self.http
                .post(format!("http://{}/api/login", self.addr))
                .json(&serde_json::json!({ "username": "admin", "password": password }))
                .send()
                .await
                .unwrap()
        }

        /// Log in and return the `name=value` pair to send back.
        async fn cookie(&self) -> String {
            let resp = self.login("hunter2").await;
            assert_eq!(resp.status(), 200);
            let set_cookie = resp.headers()[SET_COOKIE].to_str().unwrap().to_string();
            set_cookie.split(';').next().unwrap().to_string()
        }

        async fn connect(
            &self,
            process: &str,
            last_seq: u64,
            cookie: Option<&str>,
        ) -> Result<Ws, tungstenite::Error> {
            let url = format!(
                "ws://{}/api/servers/{process}/console?lastSeq={last_seq}",
                self.addr
            );
            let mut request = url.into_client_request().unwrap();
            if let Some(cookie) = cookie {
                request
                    .headers_mut()
                    .insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
            }
            tokio_tungstenite::connect_async(request)
                .await
                .map(|(ws, _)| ws)
        }
    }

    async fn next_message(ws: &mut Ws) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed");
            if let WsMessage::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    fn http_status(err: tungstenite::Error) -> u16 {
        match err {
            tungstenite::Error::Http(response) => response.status().as_u16(),
            other => panic!("expected HTTP rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn console_requires_a_session() {
        let h = start().await;
        let err = h.connect("alpha", 0, None).await.unwrap_err();
        assert_eq!(http_status(err), 401);

        let err = h
            .connect("alpha", 0, Some("panel_session=forged"))
            .await
            .unwrap_err();
        assert_eq!(http_status(err), 401);
        assert_eq!(h.state.hub.subscriber_count("alpha"), 0);
    }

    #[tokio::test]
    async fn unknown_process_is_not_found() {
        let h = start().await;
        let cookie = h.cookie().await;
        let err = h.connect("gamma", 0, Some(&cookie)).await.unwrap_err();
        assert_eq!(http_status(err), 404);
    }

    #[tokio::test]
    async fn snapshot_first_then_live_entries_and_command_echo() {
        let h = start().await;
        for line in ["Starting", "Preparing level", "Done"] {
            h.state.hub.append("alpha", line);
        }
        let cookie = h.cookie().await;
        let mut ws = h.connect("alpha", 0, Some(&cookie)).await.unwrap();

        match next_message(&mut ws).await {
            ServerMessage::Snapshot { entries, reset } => {
                assert!(reset);
                let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
                assert_eq!(seqs, vec![1, 2, 3]);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        ws.send(WsMessage::Text("  say hello  ".into())).await.unwrap();
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Log {
                seq: 4,
                line: "> say hello".into()
            }
        );
        assert_eq!(
            *h.processes.inputs.lock().unwrap(),
            vec![("alpha".to_string(), "say hello".to_string())]
        );

        h.state.hub.append("alpha", "[Server] Hello");
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Log {
                seq: 5,
                line: "[Server] Hello".into()
            }
        );
    }

    #[tokio::test]
    async fn command_echo_reaches_other_viewers() {
        let h = start().await;
        for i in 1..=5 {
            h.state.hub.append("alpha", format!("line {i}"));
        }
        let cookie = h.cookie().await;
        let mut viewer_a = h.connect("alpha", 0, Some(&cookie)).await.unwrap();
        let mut viewer_b = h.connect("alpha", 5, Some(&cookie)).await.unwrap();

        assert!(matches!(
            next_message(&mut viewer_a).await,
            ServerMessage::Snapshot { reset: true, ref entries } if entries.len() == 5
        ));
        assert_eq!(
            next_message(&mut viewer_b).await,
            ServerMessage::Snapshot {
                entries: vec![],
                reset: false
            }
        );

        viewer_b.send(WsMessage::Text("list".into())).await.unwrap();
        let expected = ServerMessage::Log {
            seq: 6,
            line: "> list".into(),
        };
        assert_eq!(next_message(&mut viewer_a).await, expected);
        assert_eq!(next_message(&mut viewer_b).await, expected);
    }

    #[tokio::test]
    async fn resume_hint_returns_only_missed_entries() {
        let h = start().await;
        for i in 1..=5 {
            h.state.hub.append("beta", format!("line {i}"));
        }
        let cookie = h.cookie().await;
        let mut ws = h.connect("beta", 3, Some(&cookie)).await.unwrap();
        match next_message(&mut ws).await {
            ServerMessage::Snapshot { entries, reset } => {
                assert!(!reset);
                let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
                assert_eq!(seqs, vec![4, 5]);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_unsubscribes_viewer() {
        let h = start().await;
        let cookie = h.cookie().await;
        let mut ws = h.connect("alpha", 0, Some(&cookie)).await.unwrap();
        next_message(&mut ws).await;
        assert_eq!(h.state.hub.subscriber_count("alpha"), 1);

        ws.close(None).await.unwrap();
        drop(ws);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.state.hub.subscriber_count("alpha") > 0 {
            assert!(tokio::time::Instant::now() < deadline, "viewer never unsubscribed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // The process keeps producing for nobody.
        assert_eq!(h.state.hub.append("alpha", "still here").seq, 1);
    }

    #[tokio::test]
    async fn viewer_with_undeliverable_command_still_unsubscribes() {
        let h = start_with(FakeProcesses {
            stuck: true,
            ..Default::default()
        })
        .await;
        let cookie = h.cookie().await;
        let mut ws = h.connect("alpha", 0, Some(&cookie)).await.unwrap();
        next_message(&mut ws).await;

        ws.send(WsMessage::Text("save-all".into())).await.unwrap();
        ws.close(None).await.unwrap();
        drop(ws);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while h.state.hub.subscriber_count("alpha") > 0 {
            assert!(tokio::time::Instant::now() < deadline, "viewer never unsubscribed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(h.processes.inputs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_open_consoles() {
        let h = start().await;
        let cookie = h.cookie().await;
        let mut ws = h.connect("alpha", 0, Some(&cookie)).await.unwrap();
        next_message(&mut ws).await;

        h.state.shutdown_tx.send(()).unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, WsMessage::Close(_)));
    }

    #[tokio::test]
    async fn login_session_logout_round() {
        let h = start().await;
        let base = format!("http://{}", h.addr);

        let resp = h.login("wrong").await;
        assert_eq!(resp.status(), 401);
        let body: AuthStatus = resp.json().await.unwrap();
        assert!(!body.authenticated);

        let resp = h.login("hunter2").await;
        assert_eq!(resp.status(), 200);
        let set_cookie = resp.headers()[SET_COOKIE].to_str().unwrap().to_string();
        assert!(set_cookie.starts_with("panel_session="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Max-Age=604800"));
        let body: AuthStatus = resp.json().await.unwrap();
        assert_eq!(body, AuthStatus::authenticated("admin"));
        let cookie = set_cookie.split(';').next().unwrap().to_string();

        let status: AuthStatus = h
            .http
            .get(format!("{base}/api/session"))
            .header(COOKIE, &cookie)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.identity.as_deref(), Some("admin"));

        let resp = h
            .http
            .post(format!("{base}/api/logout"))
            .header(COOKIE, &cookie)
            .send()
            .await
            .unwrap();
        assert!(resp.headers()[SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));

        let status: AuthStatus = h
            .http
            .get(format!("{base}/api/session"))
            .header(COOKIE, &cookie)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!status.authenticated);
    }

    #[tokio::test]
    async fn repeated_failures_are_rate_limited() {
        let h = start().await;
        for _ in 0..3 {
            assert_eq!(h.login("wrong").await.status(), 401);
        }
        let resp = h.login("hunter2").await;
        assert_eq!(resp.status(), 429);
        let retry_after: u64 = resp.headers()[RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
        let body: AuthStatus = resp.json().await.unwrap();
        assert_eq!(body.error.as_deref(), Some("rate_limited"));
        assert_eq!(body.retry_after, Some(retry_after));
    }

    #[tokio::test]
    async fn server_list_requires_a_session() {
        let h = start().await;
        let url = format!("http://{}/api/servers", h.addr);
        assert_eq!(h.http.get(&url).send().await.unwrap().status(), 401);

        let cookie = h.cookie().await;
        let list: Vec<ProcessInfo> = h
            .http
            .get(&url)
            .header(COOKIE, cookie)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].running);
    }

    #[test]
    fn cookie_parsing_picks_the_named_pair() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; panel_session=abc123; lang=en"),
        );
        assert_eq!(
            session_token(&headers, "panel_session").as_deref(),
            Some("abc123")
        );
        assert_eq!(session_token(&headers, "missing"), None);

        let secure = CookieSettings {
            name: "s".into(),
            secure: true,
            max_age: Duration::from_secs(60),
        };
        assert_eq!(
            secure.issue("tok"),
            "s=tok; HttpOnly; SameSite=Lax; Path=/; Max-Age=60; Secure"
        );
    }
}
