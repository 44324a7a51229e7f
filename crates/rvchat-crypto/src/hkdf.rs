//! HKDF-SHA256 key derivation (RFC 5869).
//!
//! Every key in the rendezvous ratchet — root keys, chain keys, message
//! keys, and the rendezvous tags themselves — is derived through this
//! module with a distinct info string for domain separation. Output is
//! zeroized on drop.

use hkdf::Hkdf;
use rvchat_types::{Result, RvChatError};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum output length in bytes.
///
/// HKDF-SHA256 can produce up to `255 × 32` bytes; we cap at 64 to
/// prevent misuse. Typical usage is 32 bytes.
const MAX_OUTPUT_LEN: usize = 64;

// ---------------------------------------------------------------------------
// HkdfOutput
// ---------------------------------------------------------------------------

/// Key material derived by HKDF-SHA256, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HkdfOutput {
    bytes: Vec<u8>,
}

impl HkdfOutput {
    /// Returns the derived key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Copies the first 32 bytes into a fixed array.
    ///
    /// # Errors
    ///
    /// [`RvChatError::Crypto`] if fewer than 32 bytes were derived.
    pub fn to_key(&self) -> Result<[u8; 32]> {
        if self.bytes.len() < 32 {
            return Err(RvChatError::Crypto {
                reason: format!("derived {} bytes, need 32", self.bytes.len()),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.bytes[..32]);
        Ok(key)
    }
}

// HkdfOutput does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derives key material from input keying material using HKDF-SHA256.
///
/// # Parameters
///
/// - `ikm` — input keying material (chain key, DH shared secret, …).
/// - `salt` — optional salt; empty is valid per RFC 5869 §3.1.
/// - `info` — domain-separation string. Each derivation purpose in the
///   ratchet uses its own constant here.
/// - `output_len` — desired length, `1..=64` bytes.
///
/// # Errors
///
/// [`RvChatError::Crypto`] if `output_len` is out of range or expansion
/// fails.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], output_len: usize) -> Result<HkdfOutput> {
    if output_len == 0 || output_len > MAX_OUTPUT_LEN {
        return Err(RvChatError::Crypto {
            reason: format!("HKDF output length {output_len} outside 1..={MAX_OUTPUT_LEN}"),
        });
    }

    let salt_opt: Option<&[u8]> = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt_opt, ikm);

    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm).map_err(|e| RvChatError::Crypto {
        reason: format!("HKDF-SHA256 expansion failed: {e}"),
    })?;

    Ok(HkdfOutput { bytes: okm })
}

/// Derives a single 32-byte key. Shorthand for the common case.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    hkdf_sha256(ikm, salt, info, 32)?.to_key()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() -> Result<()> {
        let out1 = hkdf_sha256(&[0x42; 32], b"salt", b"info", 32)?;
        let out2 = hkdf_sha256(&[0x42; 32], b"salt", b"info", 32)?;
        assert_eq!(out1.as_bytes(), out2.as_bytes());
        Ok(())
    }

    #[test]
    fn different_info_different_output() -> Result<()> {
        let a = derive_key(&[0x42; 32], b"", b"info-a")?;
        let b = derive_key(&[0x42; 32], b"", b"info-b")?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn empty_salt_is_valid() -> Result<()> {
        let out = derive_key(&[0x42; 32], b"", b"info")?;
        assert_ne!(out, [0u8; 32]);
        Ok(())
    }

    #[test]
    fn output_len_bounds_enforced() {
        assert!(hkdf_sha256(&[1; 32], b"", b"i", 0).is_err());
        assert!(hkdf_sha256(&[1; 32], b"", b"i", 65).is_err());
        assert!(hkdf_sha256(&[1; 32], b"", b"i", 64).is_ok());
    }

    /// RFC 5869 Test Case 1 (HKDF-SHA256), truncated check.
    #[test]
    fn rfc5869_test_vector_1() -> Result<()> {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00u8..=0x0c).collect();
        let info: Vec<u8> = (0xf0u8..=0xf9).collect();

        let out = hkdf_sha256(&ikm, &salt, &info, 42)?;
        let expected_prefix = [
            0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a, 0x90, 0x43, 0x4f, 0x64, 0xd0, 0x36,
            0x2f, 0x2a,
        ];
        assert_eq!(&out.as_bytes()[..16], &expected_prefix);
        Ok(())
    }
}
