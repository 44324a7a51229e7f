//! Initial key agreement and the sealed-box reply encoding.
//!
//! The X3DH-style agreement mixes three DH legs between the two
//! parties' long-term and ephemeral X25519 keys. Both sides derive the
//! same 32-byte shared root, which seeds the tag chains and the double
//! ratchet (see [`crate::ratchet`]).
//!
//! The key-exchange reply is the one message sent before any ratchet
//! exists, so it uses a minimal sealed-box: the responder's ephemeral
//! public key in the clear, followed by an AEAD ciphertext under a key
//! derived from DH(responder ephemeral, inviter ephemeral).

use rvchat_crypto::{aead, dh::DhKeyPair, hkdf};
use rvchat_types::{Result, RvChatError};

/// Domain separator for the shared-root derivation.
const ROOT_INFO: &[u8] = b"rvchat/x3dh/root/v1";

/// Domain separator for the sealed-box key.
const SEAL_INFO: &[u8] = b"rvchat/kx/seal/v1";

/// Domain separator for the sealed-box nonce.
const SEAL_NONCE_INFO: &[u8] = b"rvchat/kx/seal-nonce/v1";

// ---------------------------------------------------------------------------
// Shared root
// ---------------------------------------------------------------------------

/// Derives the shared root from the three X3DH legs.
///
/// Both parties call this with their own secrets and the other's public
/// keys; the legs are ordered canonically (inviter identity leg, then
/// responder identity leg, then ephemeral leg) so the results match.
///
/// Inviter side: `derive_shared_root(inviter_id, inviter_eph,
/// responder_id_pub, responder_eph_pub, true)`.
/// Responder side: `derive_shared_root(responder_id, responder_eph,
/// inviter_id_pub, inviter_eph_pub, false)`.
pub fn derive_shared_root(
    our_identity: &DhKeyPair,
    our_ephemeral: &DhKeyPair,
    their_identity_pub: &[u8; 32],
    their_ephemeral_pub: &[u8; 32],
    we_are_inviter: bool,
) -> Result<[u8; 32]> {
    // Leg 1: inviter identity × responder ephemeral.
    // Leg 2: inviter ephemeral × responder identity.
    // Leg 3: inviter ephemeral × responder ephemeral.
    let (d1, d2) = if we_are_inviter {
        (
            our_identity.diffie_hellman(their_ephemeral_pub)?,
            our_ephemeral.diffie_hellman(their_identity_pub)?,
        )
    } else {
        (
            our_ephemeral.diffie_hellman(their_identity_pub)?,
            our_identity.diffie_hellman(their_ephemeral_pub)?,
        )
    };
    let d3 = our_ephemeral.diffie_hellman(their_ephemeral_pub)?;

    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(&d1);
    ikm.extend_from_slice(&d2);
    ikm.extend_from_slice(&d3);

    hkdf::derive_key(&ikm, &[], ROOT_INFO)
}

// ---------------------------------------------------------------------------
// Sealed box
// ---------------------------------------------------------------------------

/// Output of [`seal_to`]: the ephemeral public key and ciphertext,
/// concatenated into one opaque blob for the relay.
pub struct SealedBoxed {
    /// `ephemeral_pub (32) || ciphertext`.
    pub blob: Vec<u8>,
}

/// Seals `plaintext` to the holder of `their_ephemeral_pub`'s secret,
/// using the provided fresh ephemeral pair.
pub fn seal_to(
    our_ephemeral: &DhKeyPair,
    their_ephemeral_pub: &[u8; 32],
    plaintext: &[u8],
) -> Result<SealedBoxed> {
    let shared = our_ephemeral.diffie_hellman(their_ephemeral_pub)?;
    let key = hkdf::derive_key(&shared, &[], SEAL_INFO)?;
    let nonce = seal_nonce(&shared)?;

    let ct = aead::encrypt(&key, &nonce, plaintext, b"kx-seal")?;
    let mut blob = Vec::with_capacity(32 + ct.len());
    blob.extend_from_slice(&our_ephemeral.public());
    blob.extend_from_slice(&ct);
    Ok(SealedBoxed { blob })
}

/// Opens a sealed blob with our ephemeral secret, returning the sender's
/// ephemeral public key and the plaintext.
///
/// # Errors
///
/// [`RvChatError::Malformed`] if the blob is too short;
/// [`RvChatError::Crypto`] on MAC failure.
pub fn open_sealed(our_ephemeral: &DhKeyPair, blob: &[u8]) -> Result<([u8; 32], Vec<u8>)> {
    if blob.len() < 32 + aead::TAG_LEN {
        return Err(RvChatError::Malformed {
            reason: format!("sealed blob too short: {} bytes", blob.len()),
        });
    }

    let mut their_pub = [0u8; 32];
    their_pub.copy_from_slice(&blob[..32]);

    let shared = our_ephemeral.diffie_hellman(&their_pub)?;
    let key = hkdf::derive_key(&shared, &[], SEAL_INFO)?;
    let nonce = seal_nonce(&shared)?;

    let plaintext = aead::decrypt(&key, &nonce, &blob[32..], b"kx-seal")?;
    Ok((their_pub, plaintext))
}

/// Derives the deterministic sealed-box nonce. The key is one-shot
/// (fresh ephemeral per seal), so a derived nonce is safe.
fn seal_nonce(shared: &[u8; 32]) -> Result<[u8; 24]> {
    let out = hkdf::hkdf_sha256(shared, &[], SEAL_NONCE_INFO, 24)?;
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(out.as_bytes());
    Ok(nonce)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_same_root() -> Result<()> {
        let inviter_id = DhKeyPair::generate();
        let inviter_eph = DhKeyPair::generate();
        let responder_id = DhKeyPair::generate();
        let responder_eph = DhKeyPair::generate();

        let inviter_root = derive_shared_root(
            &inviter_id,
            &inviter_eph,
            &responder_id.public(),
            &responder_eph.public(),
            true,
        )?;
        let responder_root = derive_shared_root(
            &responder_id,
            &responder_eph,
            &inviter_id.public(),
            &inviter_eph.public(),
            false,
        )?;

        assert_eq!(inviter_root, responder_root);
        Ok(())
    }

    #[test]
    fn different_ephemerals_different_root() -> Result<()> {
        let inviter_id = DhKeyPair::generate();
        let inviter_eph = DhKeyPair::generate();
        let responder_id = DhKeyPair::generate();

        let r1 = derive_shared_root(
            &inviter_id,
            &inviter_eph,
            &responder_id.public(),
            &DhKeyPair::generate().public(),
            true,
        )?;
        let r2 = derive_shared_root(
            &inviter_id,
            &inviter_eph,
            &responder_id.public(),
            &DhKeyPair::generate().public(),
            true,
        )?;
        assert_ne!(r1, r2);
        Ok(())
    }

    #[test]
    fn sealed_box_roundtrip() -> Result<()> {
        let inviter_eph = DhKeyPair::generate();
        let responder_eph = DhKeyPair::generate();

        let sealed = seal_to(&responder_eph, &inviter_eph.public(), b"kx reply")?;
        let (their_pub, plaintext) = open_sealed(&inviter_eph, &sealed.blob)?;

        assert_eq!(their_pub, responder_eph.public());
        assert_eq!(plaintext.as_slice(), b"kx reply");
        Ok(())
    }

    #[test]
    fn sealed_box_wrong_recipient_fails() -> Result<()> {
        let inviter_eph = DhKeyPair::generate();
        let other = DhKeyPair::generate();
        let responder_eph = DhKeyPair::generate();

        let sealed = seal_to(&responder_eph, &inviter_eph.public(), b"kx reply")?;
        assert!(open_sealed(&other, &sealed.blob).is_err());
        Ok(())
    }

    #[test]
    fn short_blob_is_malformed() {
        let eph = DhKeyPair::generate();
        let result = open_sealed(&eph, &[0u8; 10]);
        assert!(matches!(result, Err(RvChatError::Malformed { .. })));
    }
}
