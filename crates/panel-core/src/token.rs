//! Session tokens and secret hashing.
//!
//! Tokens are opaque: 32 bytes from the system CSPRNG, hex-encoded. The server
//! keeps the authoritative record; nothing is encoded inside the token.
//!
//! Operator secrets are stored as Argon2id PHC strings
//! (`$argon2id$v=19$m=...,t=...,p=...$salt$hash`), so the salt and cost
//! parameters travel with the hash.

use crate::error::{PanelError, PanelResult};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use ring::rand::{SecureRandom, SystemRandom};

/// Raw token size (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// Salt size for secret hashes.
const SALT_BYTES: usize = 16;

/// Mint a new random session token (64 hex chars).
pub fn generate_token() -> PanelResult<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    fill_random(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Hash a secret with Argon2id and a fresh random salt, in the PHC string
/// format stored in `[auth.users]`.
pub fn hash_secret(secret: &str) -> PanelResult<String> {
    hash_secret_with(&Argon2::default(), secret)
}

/// Same as [`hash_secret`] with explicit Argon2 parameters.
pub fn hash_secret_with(argon2: &Argon2<'_>, secret: &str) -> PanelResult<String> {
    let mut salt = [0u8; SALT_BYTES];
    fill_random(&mut salt)?;
    let salt = SaltString::encode_b64(&salt)
        .map_err(|e| PanelError::Other(format!("invalid salt: {e}")))?;
    let hash = argon2
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| PanelError::Other(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Check a secret against a stored PHC string. The cost parameters come from
/// the stored hash; an unparsable hash never verifies.
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    match PasswordHash::new(stored.trim()) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

fn fill_random(buf: &mut [u8]) -> PanelResult<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| PanelError::Other("system RNG failure".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::{Algorithm, Params, Version};

    fn cheap() -> Argon2<'static> {
        Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            Params::new(256, 1, 1, None).unwrap(),
        )
    }

    #[test]
    fn tokens_are_256_bit_hex_and_distinct() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn hashes_are_salted_argon2id() {
        let a = hash_secret_with(&cheap(), "abc").unwrap();
        let b = hash_secret_with(&cheap(), "abc").unwrap();
        assert!(a.starts_with("$argon2id$v=19$"), "{a}");
        assert_ne!(a, b);
        assert!(verify_secret("abc", &a));
        assert!(verify_secret("abc", &b));
    }

    #[test]
    fn default_parameters_round_trip() {
        let stored = hash_secret("hunter2").unwrap();
        assert!(verify_secret("hunter2", &stored));
        assert!(!verify_secret("hunter3", &stored));
    }

    #[test]
    fn verify_accepts_only_matching_secret() {
        let stored = hash_secret_with(&cheap(), "hunter2").unwrap();
        assert!(verify_secret("hunter2", &format!("  {stored}\n")));
        assert!(!verify_secret("hunter3", &stored));
        assert!(!verify_secret("hunter2", "not-a-hash"));
        assert!(!verify_secret(
            "abc",
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        ));
    }
}
