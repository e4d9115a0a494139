//! In-memory session table.
//!
//! Maps opaque bearer tokens to an identity and an absolute expiry. Expiry is
//! checked lazily on every validation; the periodic purge only bounds memory.

use super::credentials::CredentialVerifier;
use panel_core::{generate_token, PanelError, PanelResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default session lifetime: 7 days.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A live session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub identity: String,
    pub expires_at: Instant,
}

/// Concurrency-safe token → session table.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Verify credentials and open a session on success.
    pub async fn login(
        &self,
        verifier: &dyn CredentialVerifier,
        identity: &str,
        secret: &str,
    ) -> PanelResult<String> {
        if !verifier.verify(identity, secret) {
            return Err(PanelError::Unauthorized("invalid credentials".into()));
        }
        self.issue(identity).await
    }

    /// Mint a token for an already-verified identity.
    pub async fn issue(&self, identity: &str) -> PanelResult<String> {
        let token = generate_token()?;
        let record = SessionRecord {
            identity: identity.to_string(),
            expires_at: Instant::now() + self.ttl,
        };
        self.sessions.write().await.insert(token.clone(), record);
        info!(identity, "session issued");
        Ok(token)
    }

    /// Resolve a token to its identity. Expired records are deleted on sight.
    pub async fn validate(&self, token: &str) -> Option<String> {
        let now = Instant::now();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                None => return None,
                Some(record) if record.expires_at > now => {
                    return Some(record.identity.clone());
                }
                Some(_) => {}
            }
        }

        let mut sessions = self.sessions.write().await;
        // Another validation may have removed it in between.
        if let Some(record) = sessions.get(token) {
            if record.expires_at <= now {
                debug!(identity = %record.identity, "session expired");
                sessions.remove(token);
            }
        }
        None
    }

    /// Delete a session unconditionally. Idempotent.
    pub async fn logout(&self, token: &str) {
        if let Some(record) = self.sessions.write().await.remove(token) {
            info!(identity = %record.identity, "session closed");
        }
    }

    /// Drop every expired record. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at > now);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(count = removed, "purged expired sessions");
        }
        removed
    }

    /// Number of stored sessions (including not-yet-purged expired ones).
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn issued_token_validates_until_ttl() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        let token = store.issue("alice").await.unwrap();
        assert_eq!(store.validate(&token).await.as_deref(), Some("alice"));

        tokio::time::advance(DEFAULT_SESSION_TTL - Duration::from_secs(1)).await;
        assert_eq!(store.validate(&token).await.as_deref(), Some("alice"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.validate(&token).await, None);
        assert_eq!(store.count().await, 0, "expired record removed lazily");
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_seven_days_and_a_second() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        let token = store.issue("alice").await.unwrap();
        tokio::time::advance(Duration::from_secs(7 * 24 * 3600 + 1)).await;
        assert_eq!(store.validate(&token).await, None);
    }

    struct OnlyAlice;

    impl CredentialVerifier for OnlyAlice {
        fn verify(&self, identity: &str, secret: &str) -> bool {
            identity == "alice" && secret == "pw"
        }
    }

    #[tokio::test]
    async fn login_checks_credentials() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        let token = store.login(&OnlyAlice, "alice", "pw").await.unwrap();
        assert_eq!(store.validate(&token).await.as_deref(), Some("alice"));

        let err = store.login(&OnlyAlice, "alice", "nope").await.unwrap_err();
        assert!(matches!(err, PanelError::Unauthorized(_)));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        assert_eq!(store.validate("deadbeef").await, None);
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        let token = store.issue("bob").await.unwrap();
        store.logout(&token).await;
        store.logout(&token).await;
        assert_eq!(store.validate(&token).await, None);
    }

    #[tokio::test]
    async fn relogin_mints_independent_tokens() {
        let store = SessionStore::new(DEFAULT_SESSION_TTL);
        let first = store.issue("carol").await.unwrap();
        let second = store.issue("carol").await.unwrap();
        assert_ne!(first, second);
        store.logout(&first).await;
        assert_eq!(store.validate(&second).await.as_deref(), Some("carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired() {
        let store = SessionStore::new(Duration::from_secs(60));
        let _old = store.issue("old").await.unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        let fresh = store.issue("fresh").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.validate(&fresh).await.as_deref(), Some("fresh"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_validation() {
        let store = Arc::new(SessionStore::new(DEFAULT_SESSION_TTL));
        let token = store.issue("dave").await.unwrap();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                let token = token.clone();
                tokio::spawn(async move { store.validate(&token).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().as_deref(), Some("dave"));
        }
    }
}
