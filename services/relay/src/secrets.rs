//! Keychain-backed encryption key for the local state stores.
//!
//! The 256-bit AEAD key is generated once, stored base64-encoded in the OS
//! keychain under the configured service/account pair, and read back on every
//! subsequent start. A malformed existing entry is an error, never silently
//! regenerated -- a fresh key would orphan the encrypted stores.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use std::time::Duration;

/// Keychain calls can hang on a locked session; cap them at 5 s.
const KEYCHAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Key type
// ---------------------------------------------------------------------------

/// A 256-bit AEAD key. Debug output never prints key material.
#[derive(Clone)]
pub struct StateKey(pub [u8; 32]);

impl std::fmt::Debug for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("keychain unavailable: {0}")]
    KeychainUnavailable(String),
    #[error("keychain entry is malformed: {0}")]
    Malformed(String),
    #[error("keychain access timed out after {}s", KEYCHAIN_TIMEOUT.as_secs())]
    Timeout,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Return the state-store key, generating and persisting it on first run.
///
/// Keychain access is blocking platform API; it runs on the blocking pool
/// under the 5 s timeout.
pub async fn ensure_key(service: &str, account: &str) -> Result<StateKey, SecretError> {
    let service = service.to_owned();
    let account = account.to_owned();
    let task = tokio::task::spawn_blocking(move || ensure_key_blocking(&service, &account));
    match tokio::time::timeout(KEYCHAIN_TIMEOUT, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(SecretError::KeychainUnavailable(join_err.to_string())),
        Err(_elapsed) => Err(SecretError::Timeout),
    }
}

fn ensure_key_blocking(service: &str, account: &str) -> Result<StateKey, SecretError> {
    let entry = keyring::Entry::new(service, account)
        .map_err(|e| SecretError::KeychainUnavailable(e.to_string()))?;

    match entry.get_password() {
        Ok(encoded) => decode_key(&encoded),
        Err(keyring::Error::NoEntry) => {
            let key = generate_key();
            entry
                .set_password(&BASE64.encode(key.0))
                .map_err(|e| SecretError::KeychainUnavailable(e.to_string()))?;
            Ok(key)
        }
        Err(e) => Err(SecretError::KeychainUnavailable(e.to_string())),
    }
}

fn generate_key() -> StateKey {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    StateKey(bytes)
}

fn decode_key(encoded: &str) -> Result<StateKey, SecretError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| SecretError::Malformed(format!("not base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|v: Vec<u8>| SecretError::Malformed(format!("expected 32 bytes, got {}", v.len())))?;
    Ok(StateKey(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn decode_round_trips_encoded_key() {
        let key = generate_key();
        let decoded = decode_key(&BASE64.encode(key.0)).unwrap();
        assert_eq!(decoded.0, key.0);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key(&BASE64.encode([0u8; 16])).unwrap_err();
        assert!(matches!(err, SecretError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_key("not base64!!!"),
            Err(SecretError::Malformed(_))
        ));
    }

    #[test]
    fn debug_never_prints_key_material() {
        let key = StateKey([0xAB; 32]);
        assert_eq!(format!("{key:?}"), "StateKey(..)");
    }
}
