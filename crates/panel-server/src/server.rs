//! Server assembly and lifecycle.
//!
//! Builds the console hub (restoring recorded history), the auth service and
//! the process manager from a resolved [`ServerConfig`], then serves HTTP
//! until the shutdown future resolves.

use crate::auth::{AuthService, ConfigCredentials, LoginThrottle, SessionStore};
use crate::config::ServerConfig;
use crate::console::{load_recording, recording_path, ConsoleHub, ConsoleRecorder};
use crate::http::{router, AppState, CookieSettings};
use crate::process::LocalProcessManager;
use panel_core::PanelResult;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Interval of the session/throttle housekeeping task.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// The panel server instance.
pub struct PanelServer {
    config: ServerConfig,
    processes: Arc<LocalProcessManager>,
    state: AppState,
}

impl PanelServer {
    /// Create a server instance. Recorded console history is loaded here so
    /// that sequence numbers continue where the previous run stopped.
    pub async fn new(config: ServerConfig) -> PanelResult<Self> {
        let hub = match &config.record_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let recorder = ConsoleRecorder::spawn(dir.clone(), config.buffer_capacity);
                let hub = ConsoleHub::with_recorder(
                    config.buffer_capacity,
                    config.subscriber_queue,
                    recorder,
                );
                for spec in &config.processes {
                    let path = recording_path(dir, &spec.id);
                    let recording = load_recording(&path, config.buffer_capacity).await?;
                    if recording.high_water == 0 {
                        continue;
                    }
                    if recording.is_contiguous() {
                        info!(
                            process_id = %spec.id,
                            entries = recording.entries.len(),
                            "restored console history"
                        );
                    } else {
                        warn!(
                            process_id = %spec.id,
                            high_water = recording.high_water,
                            "recorded history is incomplete, viewers will reset"
                        );
                    }
                    hub.restore(&spec.id, recording);
                }
                hub
            }
            None => ConsoleHub::new(config.buffer_capacity, config.subscriber_queue),
        };

        let credentials = ConfigCredentials::new(config.users.clone());
        if credentials.is_empty() {
            warn!("no users configured in [auth.users], every login will fail");
        }
        let auth = AuthService::new(
            SessionStore::new(config.session_ttl),
            LoginThrottle::new(config.throttle),
            Arc::new(credentials),
        );

        let processes = Arc::new(LocalProcessManager::new(
            config.processes.clone(),
            hub.clone(),
        ));

        let state = AppState {
            auth: Arc::new(auth),
            hub,
            processes: processes.clone(),
            cookie: CookieSettings {
                name: config.cookie_name.clone(),
                secure: config.secure_cookie,
                max_age: config.session_ttl,
            },
            shutdown_tx: broadcast::channel(1).0,
        };

        Ok(Self {
            config,
            processes,
            state,
        })
    }

    /// Start the managed processes and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> PanelResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let started = self.processes.start_all().await;
        info!(
            started,
            configured = self.config.processes.len(),
            "managed processes launched"
        );

        let gc_auth = self.state.auth.clone();
        let gc_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                gc_auth.gc().await;
            }
        });

        let listener = TcpListener::bind(self.config.listen).await?;
        let local = listener.local_addr()?;
        info!(listen = %local, "panel-server ready");

        let shutdown_tx = self.state.shutdown_tx.clone();
        let hub = self.state.hub.clone();
        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("broadcasting shutdown to open consoles");
                let _ = shutdown_tx.send(());
            })
            .await;

        gc_task.abort();
        hub.close_recording().await;
        result?;
        Ok(())
    }
}
