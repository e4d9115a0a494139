//! Authentication: sessions, login throttling, credential checks.

pub mod credentials;
pub mod sessions;
pub mod throttle;

pub use credentials::{ConfigCredentials, CredentialVerifier};
pub use sessions::{SessionStore, DEFAULT_SESSION_TTL};
pub use throttle::{LoginThrottle, ThrottlePolicy};

use panel_core::{PanelError, PanelResult};
use std::sync::Arc;
use tracing::{info, warn};

/// Login flow: throttle check, credential check, session issuance.
pub struct AuthService {
    sessions: SessionStore,
    throttle: LoginThrottle,
    verifier: Arc<dyn CredentialVerifier>,
}

impl AuthService {
    pub fn new(
        sessions: SessionStore,
        throttle: LoginThrottle,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            sessions,
            throttle,
            verifier,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Attempt a login from `source`. A locked-out source is rejected before
    /// the verifier is consulted.
    pub async fn login(&self, source: &str, identity: &str, secret: &str) -> PanelResult<String> {
        if let Some(retry_after) = self.throttle.is_blocked(source).await {
            warn!(source, identity, "login rejected, source locked out");
            return Err(PanelError::RateLimited { retry_after });
        }

        match self
            .sessions
            .login(self.verifier.as_ref(), identity, secret)
            .await
        {
            Ok(token) => {
                self.throttle.record_success(source).await;
                info!(source, identity, "login succeeded");
                Ok(token)
            }
            Err(PanelError::Unauthorized(reason)) => {
                self.throttle.record_failure(source).await;
                warn!(source, identity, "login failed");
                Err(PanelError::Unauthorized(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a bearer token to an identity.
    pub async fn authenticate(&self, token: Option<&str>) -> PanelResult<String> {
        let token = token.ok_or_else(|| PanelError::Unauthorized("no session".into()))?;
        self.sessions
            .validate(token)
            .await
            .ok_or_else(|| PanelError::Unauthorized("invalid or expired session".into()))
    }

    pub async fn logout(&self, token: &str) {
        self.sessions.logout(token).await;
    }

    /// Periodic housekeeping; validation does not depend on it.
    pub async fn gc(&self) {
        self.sessions.purge_expired().await;
        self.throttle.gc().await;
    }
}
