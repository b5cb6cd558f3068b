//! At-rest encryption for stored credentials (OAuth tokens, API keys).
//!
//! AES-256-GCM, key derived from `RELAY_ENCRYPTION_KEY` via SHA-256.
//! Stored values are `enc:<base64(nonce || ciphertext)>`; rows written
//! before a key was configured stay plaintext and decrypt transparently.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

const ENCRYPTED_PREFIX: &str = "enc:";
const NONCE_LEN: usize = 12;

/// Derive a 256-bit key from the env var. `None` = plaintext mode.
fn encryption_key() -> Option<[u8; 32]> {
    let raw = std::env::var("RELAY_ENCRYPTION_KEY")
        .ok()
        .filter(|s| !s.is_empty())?;
    let hash = Sha256::digest(raw.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash);
    Some(key)
}

/// Encrypt a credential for storage. Returns the input unchanged when no
/// key is configured or encryption fails.
pub fn seal(plaintext: &str) -> String {
    let Some(key_bytes) = encryption_key() else {
        return plaintext.to_string();
    };

    use aes_gcm::aead::{Aead, KeyInit, OsRng};
    use aes_gcm::{AeadCore, Aes256Gcm};

    let cipher = Aes256Gcm::new_from_slice(&key_bytes).expect("AES-256-GCM key is exactly 32 bytes");
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    match cipher.encrypt(&nonce, plaintext.as_bytes()) {
        Ok(ciphertext) => {
            let mut combined = nonce.to_vec();
            combined.extend_from_slice(&ciphertext);
            format!("{}{}", ENCRYPTED_PREFIX, STANDARD.encode(&combined))
        }
        Err(e) => {
            tracing::error!("credential encryption failed: {} — storing plaintext", e);
            plaintext.to_string()
        }
    }
}

/// Decrypt a stored credential. Handles both `enc:` and legacy plaintext.
pub fn open(stored: &str) -> Option<String> {
    if !stored.starts_with(ENCRYPTED_PREFIX) {
        return Some(stored.to_string());
    }

    let key_bytes = encryption_key()?;
    let encoded = &stored[ENCRYPTED_PREFIX.len()..];
    let combined = STANDARD.decode(encoded).ok()?;
    if combined.len() < NONCE_LEN {
        tracing::error!("credential decryption: data too short");
        return None;
    }

    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(&key_bytes).expect("AES-256-GCM key is exactly 32 bytes");

    match cipher.decrypt(nonce, ciphertext) {
        Ok(plaintext) => String::from_utf8(plaintext).ok(),
        Err(e) => {
            tracing::error!("credential decryption failed: {}", e);
            None
        }
    }
}

/// Seal an optional credential, passing `None` through.
pub fn seal_opt(plaintext: Option<&str>) -> Option<String> {
    plaintext.map(seal)
}

/// Open an optional stored credential. A value that fails to decrypt is
/// surfaced as `None` so callers treat the account as missing credentials.
pub fn open_opt(stored: Option<&str>) -> Option<String> {
    stored.and_then(open)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_passes_through_without_key() {
        // Tests run without RELAY_ENCRYPTION_KEY by default.
        if std::env::var("RELAY_ENCRYPTION_KEY").is_ok() {
            return;
        }
        assert_eq!(seal("sk-ant-123456"), "sk-ant-123456");
        assert_eq!(open("sk-ant-123456").as_deref(), Some("sk-ant-123456"));
    }

    #[test]
    fn legacy_plaintext_always_opens() {
        assert_eq!(open("plain-value").as_deref(), Some("plain-value"));
    }

    #[test]
    fn short_encrypted_blob_is_rejected() {
        // Without a configured key `open` falls back to None only for enc: rows.
        if std::env::var("RELAY_ENCRYPTION_KEY").is_ok() {
            return;
        }
        assert_eq!(open("enc:AAAA"), None);
    }
}
