//! AEAD sealing of tokens and proxy passwords at rest.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("sealed value has the wrong shape (expected iv.tag.ciphertext)")]
    MalformedEnvelope,
    #[error("sealed value is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("decryption failed: the sealed value was corrupted or sealed with a different key")]
    DecryptionFailed,
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Holds the process-wide AES-256-GCM key, derived once at startup.
#[derive(Clone)]
pub struct CredentialStore {
    key: [u8; 32],
}

impl CredentialStore {
    /// Derives the 32-byte key from `TOKEN_ENCRYPTION_KEY`: 64 hex chars are decoded directly,
    /// a 32-byte base64 string is used as-is, otherwise the raw string is SHA-256 hashed.
    pub fn from_secret(secret: &str) -> Self {
        let key = if secret.len() == 64 && secret.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut bytes = [0u8; 32];
            hex::decode_to_slice(secret, &mut bytes).expect("validated hex string");
            bytes
        } else if let Ok(decoded) = BASE64.decode(secret) {
            if decoded.len() == 32 {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&decoded);
                bytes
            } else {
                Self::sha256_fallback(secret)
            }
        } else {
            Self::sha256_fallback(secret)
        };
        Self { key }
    }

    fn sha256_fallback(secret: &str) -> [u8; 32] {
        warn!("TOKEN_ENCRYPTION_KEY is neither 64 hex chars nor 32-byte base64; falling back to SHA-256 of the raw string. Supply a proper 32-byte key in production.");
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.finalize().into()
    }

    /// Encrypts `plaintext` with a fresh random 12-byte IV. Failure here is a programmer error
    /// (bad key length, which can't happen once constructed) and is not modeled as `Result`.
    pub fn seal(&self, plaintext: &str) -> String {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut iv_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv_bytes);
        let nonce = Nonce::from_slice(&iv_bytes);

        let mut ciphertext_and_tag = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-256-GCM encryption with a valid key cannot fail");
        // `aes-gcm` appends the 16-byte tag to the ciphertext; split it out so the wire
        // format matches the documented `iv.tag.ciphertext` triple.
        let tag = ciphertext_and_tag.split_off(ciphertext_and_tag.len() - 16);
        let ciphertext = ciphertext_and_tag;

        format!(
            "{}.{}.{}",
            BASE64.encode(iv_bytes),
            BASE64.encode(tag),
            BASE64.encode(ciphertext)
        )
    }

    /// Opens a value produced by [`CredentialStore::seal`]. Never panics: a corrupted or
    /// foreign-key-sealed value returns `Err` so callers can block the schedule rather than crash.
    pub fn open(&self, sealed: &str) -> Result<String, CredentialError> {
        let mut parts = sealed.splitn(3, '.');
        let (iv_b64, tag_b64, ciphertext_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(iv), Some(tag), Some(ct)) if parts.next().is_none() => (iv, tag, ct),
            _ => return Err(CredentialError::MalformedEnvelope),
        };

        let iv = BASE64.decode(iv_b64)?;
        let tag = BASE64.decode(tag_b64)?;
        let ciphertext = BASE64.decode(ciphertext_b64)?;
        if iv.len() != NONCE_LEN {
            return Err(CredentialError::MalformedEnvelope);
        }

        let mut combined = ciphertext;
        combined.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Nonce::from_slice(&iv);
        let plaintext = cipher
            .decrypt(nonce, combined.as_ref())
            .map_err(|_| CredentialError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CredentialError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::from_secret("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcd")
    }

    #[test]
    fn round_trips_any_utf8_string() {
        let store = store();
        for s in ["", "hello world", "日本語のテキスト", "🦀🦀🦀"] {
            let sealed = store.seal(s);
            assert_eq!(store.open(&sealed).unwrap(), s);
        }
    }

    #[test]
    fn open_fails_on_corrupted_segment() {
        let store = store();
        let sealed = store.seal("top secret refresh token");
        let mut segments: Vec<&str> = sealed.split('.').collect();
        let mut corrupted = segments[2].to_string();
        corrupted.push('A');
        segments[2] = &corrupted;
        let tampered = segments.join(".");
        assert!(store.open(&tampered).is_err());
    }

    #[test]
    fn open_fails_on_wrong_key() {
        let sealed = store().seal("secret");
        let other = CredentialStore::from_secret("a-completely-different-passphrase");
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn derives_key_from_hex_base64_and_arbitrary_string_without_panicking() {
        let hex_key = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcd";
        let _ = CredentialStore::from_secret(hex_key);

        let b64_key = BASE64.encode([7u8; 32]);
        let _ = CredentialStore::from_secret(&b64_key);

        let _ = CredentialStore::from_secret("whatever the operator typed in");
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        let store = store();
        assert!(store.open("not-even-three-segments").is_err());
        assert!(store.open("a.b.c.d").is_err());
    }
}
