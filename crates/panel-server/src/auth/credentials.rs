//! Credential verification.

use panel_core::verify_secret;
use std::collections::HashMap;
use tracing::debug;

/// Checks an identity/secret pair. Implementations must be cheap to call
/// concurrently; the login path never holds a lock across this call.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, identity: &str, secret: &str) -> bool;
}

/// Verifies against the Argon2 PHC strings listed in `[auth.users]`.
#[derive(Debug, Clone, Default)]
pub struct ConfigCredentials {
    users: HashMap<String, String>,
}

impl ConfigCredentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialVerifier for ConfigCredentials {
    fn verify(&self, identity: &str, secret: &str) -> bool {
        match self.users.get(identity) {
            Some(expected) => verify_secret(secret, expected),
            None => {
                debug!(identity, "unknown user");
                false
            }
        }
    }
}
