//! Media encryption (C4). AES-256-CFB stream cipher over a PBKDF2-HMAC-SHA256
//! derived subkey, per-packet IVs. See SPEC_FULL.md §I for why CFB (not an
//! AEAD mode) is the correct reading of the source spec.

use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use parking_lot::RwLock;
use rand::RngCore;
use tracing::{error, info};

type Aes256CfbEnc = Encryptor<Aes256>;
type Aes256CfbDec = Decryptor<Aes256>;

pub const IV_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

/// Per-endpoint key material: a long-term secret (never transmitted), a
/// salt, and the derived subkey.
#[derive(Clone)]
pub struct SessionKey {
    pub secret: [u8; KEY_LEN],
    pub salt: [u8; SALT_LEN],
    derived: [u8; KEY_LEN],
}

impl SessionKey {
    pub fn generate(iterations: u32) -> Self {
        let mut secret = [0u8; KEY_LEN];
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        rand::thread_rng().fill_bytes(&mut salt);
        Self::derive(secret, salt, iterations)
    }

    pub fn derive(secret: [u8; KEY_LEN], salt: [u8; SALT_LEN], iterations: u32) -> Self {
        let derived = pbkdf2_derive(&secret, &salt, iterations);
        SessionKey {
            secret,
            salt,
            derived,
        }
    }
}

fn pbkdf2_derive(secret: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    let n = std::num::NonZeroU32::new(iterations.max(1)).unwrap();
    ring::pbkdf2::derive(ring::pbkdf2::PBKDF2_HMAC_SHA256, n, salt, secret, &mut out);
    out
}

/// Read-mostly after setup; `set_key` takes a write lock so in-flight
/// encrypt/decrypt calls using the old key complete against their own copy.
pub struct MediaCipher {
    derived_key: RwLock<[u8; KEY_LEN]>,
}

impl MediaCipher {
    pub fn new(key: &SessionKey) -> Self {
        MediaCipher {
            derived_key: RwLock::new(key.derived),
        }
    }

    /// Generates a fresh IV and encrypts `plaintext`. Never fails in
    /// practice (CFB has no alignment requirement) but returns `None` on any
    /// unexpected error to honor the "never abort the process" policy.
    pub fn encrypt(&self, plaintext: &[u8]) -> Option<(Vec<u8>, [u8; IV_LEN])> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let key = *self.derived_key.read();
        let mut buf = plaintext.to_vec();
        Aes256CfbEnc::new((&key).into(), (&iv).into()).encrypt(&mut buf);
        Some((buf, iv))
    }

    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8; IV_LEN]) -> Option<Vec<u8>> {
        let key = *self.derived_key.read();
        let mut buf = ciphertext.to_vec();
        let decryptor = Aes256CfbDec::new((&key).into(), iv.into());
        decryptor.decrypt(&mut buf);
        Some(buf)
    }

    /// Swaps the key at runtime. Packets already decrypted under the old
    /// key are unaffected; subsequent calls use the new key.
    pub fn set_key(&self, secret: [u8; KEY_LEN], salt: [u8; SALT_LEN], iterations: u32) {
        let derived = pbkdf2_derive(&secret, &salt, iterations);
        *self.derived_key.write() = derived;
        info!("media cipher key updated");
    }
}

impl std::fmt::Debug for MediaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCipher").finish_non_exhaustive()
    }
}

/// Builds and logs a `CipherFailure` for a caller that got `None` back from
/// `encrypt`/`decrypt`. CFB itself never fails, but malformed wire data
/// upstream (e.g. a truncated ciphertext) can still reach this call site, so
/// the error kind named in the error-handling design has a real producer.
pub fn log_cipher_failure(context: &str) -> crate::error::VoipError {
    let err = crate::error::VoipError::CipherFailure(context.to_string());
    error!(error = %err, "cipher failure");
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let key = SessionKey::generate(1000);
        let cipher = MediaCipher::new(&key);
        let plaintext = vec![7u8; 400];
        let (ciphertext, iv) = cipher.encrypt(&plaintext).unwrap();
        let recovered = cipher.decrypt(&ciphertext, &iv).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn two_encryptions_use_different_ivs() {
        let key = SessionKey::generate(1000);
        let cipher = MediaCipher::new(&key);
        let plaintext = vec![9u8; 400];
        let (c1, iv1) = cipher.encrypt(&plaintext).unwrap();
        let (c2, iv2) = cipher.encrypt(&plaintext).unwrap();
        assert_ne!(iv1, iv2);
        assert_ne!(c1, c2);
        assert_eq!(cipher.decrypt(&c1, &iv1).unwrap(), plaintext);
        assert_eq!(cipher.decrypt(&c2, &iv2).unwrap(), plaintext);
    }

    #[test]
    fn set_key_changes_derived_output() {
        let key = SessionKey::generate(1000);
        let cipher = MediaCipher::new(&key);
        let plaintext = vec![3u8; 64];
        let (c1, iv) = cipher.encrypt(&plaintext).unwrap();

        let new_key = SessionKey::generate(1000);
        cipher.set_key(new_key.secret, new_key.salt, 1000);
        let wrong = cipher.decrypt(&c1, &iv).unwrap();
        assert_ne!(wrong, plaintext);
    }

    #[test]
    fn derive_is_deterministic_given_same_inputs() {
        let secret = [1u8; KEY_LEN];
        let salt = [2u8; SALT_LEN];
        let a = SessionKey::derive(secret, salt, 1000);
        let b = SessionKey::derive(secret, salt, 1000);
        assert_eq!(a.derived, b.derived);
    }
}
