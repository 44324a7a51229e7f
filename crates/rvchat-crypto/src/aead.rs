//! XChaCha20-Poly1305 authenticated encryption.
//!
//! All routed-message ciphertexts use XChaCha20-Poly1305 with 24-byte
//! nonces. Within the ratchet every message key is used exactly once, so
//! nonces there are deterministic; blob encryption outside the ratchet
//! generates nonces from OS entropy.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use rvchat_types::{Result, RvChatError};

/// Poly1305 authentication tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 24;

/// Generates a fresh 24-byte nonce from OS entropy.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Encrypts `plaintext` with XChaCha20-Poly1305.
///
/// `aad` is authenticated but not encrypted; pass `&[]` if unused.
/// Returns the ciphertext with the 16-byte tag appended.
pub fn encrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| RvChatError::Crypto {
            reason: format!("XChaCha20-Poly1305 encryption failed: {e}"),
        })
}

/// Decrypts `ciphertext` (with appended tag) with XChaCha20-Poly1305.
///
/// # Errors
///
/// [`RvChatError::Crypto`] if tag verification fails: wrong key, wrong
/// nonce, tampered ciphertext, or mismatched AAD.
pub fn decrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|e| RvChatError::Crypto {
            reason: format!("XChaCha20-Poly1305 decryption failed: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() -> Result<()> {
        let key = [0x42u8; 32];
        let nonce = generate_nonce();
        let plaintext = b"routed message bytes";

        let ct = encrypt(&key, &nonce, plaintext, b"header")?;
        assert_eq!(ct.len(), plaintext.len() + TAG_LEN);

        let pt = decrypt(&key, &nonce, &ct, b"header")?;
        assert_eq!(pt.as_slice(), plaintext.as_slice());
        Ok(())
    }

    #[test]
    fn empty_plaintext_roundtrip() -> Result<()> {
        let key = [0x01u8; 32];
        let nonce = generate_nonce();

        let ct = encrypt(&key, &nonce, b"", b"")?;
        assert_eq!(ct.len(), TAG_LEN);

        let pt = decrypt(&key, &nonce, &ct, b"")?;
        assert!(pt.is_empty());
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> Result<()> {
        let nonce = generate_nonce();
        let ct = encrypt(&[0x42; 32], &nonce, b"secret", b"")?;
        assert!(decrypt(&[0x43; 32], &nonce, &ct, b"").is_err());
        Ok(())
    }

    #[test]
    fn wrong_aad_fails() -> Result<()> {
        let key = [0x42u8; 32];
        let nonce = generate_nonce();
        let ct = encrypt(&key, &nonce, b"secret", b"aad-a")?;
        assert!(decrypt(&key, &nonce, &ct, b"aad-b").is_err());
        Ok(())
    }

    #[test]
    fn tampered_ciphertext_fails() -> Result<()> {
        let key = [0x42u8; 32];
        let nonce = generate_nonce();
        let mut ct = encrypt(&key, &nonce, b"secret", b"")?;
        ct[0] ^= 0xFF;
        assert!(decrypt(&key, &nonce, &ct, b"").is_err());
        Ok(())
    }

    #[test]
    fn generated_nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
