//! Per-peer, per-direction double ratchet with rendezvous tag chains.
//!
//! One [`Ratchet`] instance covers both directions with a single peer.
//! Sending seals a plaintext into `(RvTag, blob)`; receiving opens a
//! blob that arrived at one of the expected tags. All state mutation is
//! transactional: a failed open leaves the ratchet exactly as it was.
//!
//! # Blob layout
//!
//! ```text
//! u16 BE header_ct length || header_ct || payload_ct
//! ```
//!
//! The header travels under the tag chain's header key (always
//! derivable by the receiver); the payload under the double-ratchet
//! message key, which the header identifies.

use std::collections::VecDeque;

use rvchat_crypto::{aead, dh::DhKeyPair, hkdf};
use rvchat_types::{Result, RvChatError, RvTag};
use serde::{Deserialize, Serialize};

// Domain-separation strings. Changing any of these is a protocol break.
const TAG_SEED_A2B: &[u8] = b"rvchat/tags/inviter-to-responder/v1";
const TAG_SEED_B2A: &[u8] = b"rvchat/tags/responder-to-inviter/v1";
const TAG_CHAIN_INFO: &[u8] = b"rvchat/tag/chain/v1";
const TAG_INFO: &[u8] = b"rvchat/tag/rv/v1";
const HEADER_KEY_INFO: &[u8] = b"rvchat/tag/header-key/v1";
const HEADER_NONCE_INFO: &[u8] = b"rvchat/tag/header-nonce/v1";
const ROOT_STEP_INFO: &[u8] = b"rvchat/dr/root-step/v1";
const CHAIN_INFO: &[u8] = b"rvchat/dr/chain/v1";
const MSG_KEY_INFO: &[u8] = b"rvchat/dr/message-key/v1";
const MSG_NONCE_INFO: &[u8] = b"rvchat/dr/message-nonce/v1";

/// AAD label binding header ciphertexts to their tag.
const HEADER_AAD: &[u8] = b"hdr";
/// AAD label binding payload ciphertexts to their tag.
const PAYLOAD_AAD: &[u8] = b"msg";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunables for a ratchet instance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RatchetConfig {
    /// Skipped-key cache bound and receive-tag look-ahead. Arrivals
    /// further ahead of the receiving chain than this fail decryption.
    pub window: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self { window: 64 }
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Per-message ratchet header, encrypted under the tag chain's header
/// key.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Sender's current ratchet public key. A value the receiver has
    /// not seen announces a DH step.
    pub dh_pub: [u8; 32],
    /// Length of the sender's previous sending chain.
    pub prev_chain_len: u32,
    /// Position of this message in the sender's current sending chain.
    pub counter: u32,
}

/// One step of the sending ratchet, as consumed by the outbox.
pub struct SendStep {
    /// Tag to push the blob at.
    pub tag: RvTag,
    /// The sealed blob.
    pub blob: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Internal records
// ---------------------------------------------------------------------------

/// A pre-derived receive tag with its header key material.
#[derive(Clone, Serialize, Deserialize)]
struct RecvTag {
    index: u64,
    tag: RvTag,
    header_key: [u8; 32],
    header_nonce: [u8; 24],
}

/// A cached message key for a skipped (not yet arrived) message.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_pub: [u8; 32],
    counter: u32,
    message_key: [u8; 32],
    nonce: [u8; 24],
}

// ---------------------------------------------------------------------------
// Ratchet
// ---------------------------------------------------------------------------

/// Double-ratchet state for one peer.
///
/// Serializable: the registry persists one of these per peer, and every
/// advance is written to disk before the corresponding network push.
#[derive(Clone, Serialize, Deserialize)]
pub struct Ratchet {
    root_key: [u8; 32],

    dhs: DhKeyPair,
    dhr: Option<[u8; 32]>,

    cks: Option<[u8; 32]>,
    ckr: Option<[u8; 32]>,

    ns: u32,
    nr: u32,
    pn: u32,

    send_tag_key: [u8; 32],
    send_tag_index: u64,

    recv_tag_key: [u8; 32],
    recv_tag_index: u64,
    recv_window: VecDeque<RecvTag>,

    skipped: VecDeque<SkippedKey>,

    config: RatchetConfig,
}

impl Ratchet {
    /// Creates the inviter's half after key exchange.
    ///
    /// The inviter performs the first DH step immediately against the
    /// responder's ratchet key, so it can send right away.
    pub fn new_inviter(
        shared_root: [u8; 32],
        their_ratchet_pub: [u8; 32],
        config: RatchetConfig,
    ) -> Result<Self> {
        let send_tag_key = hkdf::derive_key(&shared_root, &[], TAG_SEED_A2B)?;
        let recv_tag_key = hkdf::derive_key(&shared_root, &[], TAG_SEED_B2A)?;

        let dhs = DhKeyPair::generate();
        let (root_key, cks) = root_step(&shared_root, &dhs.diffie_hellman(&their_ratchet_pub)?)?;

        let mut ratchet = Self {
            root_key,
            dhs,
            dhr: Some(their_ratchet_pub),
            cks: Some(cks),
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            send_tag_key,
            send_tag_index: 0,
            recv_tag_key,
            recv_tag_index: 0,
            recv_window: VecDeque::new(),
            skipped: VecDeque::new(),
            config,
        };
        ratchet.fill_recv_window()?;
        Ok(ratchet)
    }

    /// Creates the responder's half after key exchange.
    ///
    /// `our_ratchet_pair` is the ephemeral pair the responder published
    /// in its reply; the inviter's first message performs the DH step
    /// that establishes both chains on this side.
    pub fn new_responder(
        shared_root: [u8; 32],
        our_ratchet_pair: DhKeyPair,
        config: RatchetConfig,
    ) -> Result<Self> {
        let send_tag_key = hkdf::derive_key(&shared_root, &[], TAG_SEED_B2A)?;
        let recv_tag_key = hkdf::derive_key(&shared_root, &[], TAG_SEED_A2B)?;

        let mut ratchet = Self {
            root_key: shared_root,
            dhs: our_ratchet_pair,
            dhr: None,
            cks: None,
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            send_tag_key,
            send_tag_index: 0,
            recv_tag_key,
            recv_tag_index: 0,
            recv_window: VecDeque::new(),
            skipped: VecDeque::new(),
            config,
        };
        ratchet.fill_recv_window()?;
        Ok(ratchet)
    }

    /// Whether the sending chain is established. The responder cannot
    /// send until the inviter's first message arrives.
    pub fn can_send(&self) -> bool {
        self.cks.is_some()
    }

    /// The tag the next outbound message will use, without advancing.
    pub fn next_send_rv(&self) -> Result<RvTag> {
        Ok(RvTag::new(hkdf::derive_key(
            &self.send_tag_key,
            &[],
            TAG_INFO,
        )?))
    }

    /// The tag at which the next in-order inbound message is expected.
    pub fn next_recv_rv(&self) -> Option<RvTag> {
        self.recv_window.front().map(|e| e.tag)
    }

    /// All tags currently expected inbound, in tag-chain order. The
    /// client subscribes to each of these.
    pub fn recv_tags(&self) -> Vec<RvTag> {
        self.recv_window.iter().map(|e| e.tag).collect()
    }

    /// Seals a plaintext for the peer, advancing the sending chain and
    /// the send tag chain.
    ///
    /// # Errors
    ///
    /// - [`RvChatError::RatchetDesync`] if the sending chain is not yet
    ///   established.
    /// - [`RvChatError::Fatal`] if the sending chain counter is
    ///   exhausted.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<SendStep> {
        let cks = self.cks.ok_or_else(|| RvChatError::RatchetDesync {
            reason: "sending chain not established; awaiting first inbound message".into(),
        })?;

        if self.ns == u32::MAX {
            return Err(RvChatError::Fatal {
                reason: "sending chain exhausted".into(),
            });
        }

        // Tag chain step.
        let tag = RvTag::new(hkdf::derive_key(&self.send_tag_key, &[], TAG_INFO)?);
        let header_key = hkdf::derive_key(&self.send_tag_key, &[], HEADER_KEY_INFO)?;
        let header_nonce = derive_nonce(&self.send_tag_key, HEADER_NONCE_INFO)?;
        let next_tag_key = hkdf::derive_key(&self.send_tag_key, &[], TAG_CHAIN_INFO)?;

        // Message chain step.
        let message_key = hkdf::derive_key(&cks, &[], MSG_KEY_INFO)?;
        let msg_nonce = derive_nonce(&cks, MSG_NONCE_INFO)?;
        let next_cks = hkdf::derive_key(&cks, &[], CHAIN_INFO)?;

        let header = Header {
            dh_pub: self.dhs.public(),
            prev_chain_len: self.pn,
            counter: self.ns,
        };
        let header_bytes = serde_json::to_vec(&header).map_err(|e| RvChatError::Malformed {
            reason: format!("header encoding failed: {e}"),
        })?;

        let header_ct = aead::encrypt(&header_key, &header_nonce, &header_bytes, HEADER_AAD)?;
        let payload_ct = aead::encrypt(&message_key, &msg_nonce, plaintext, PAYLOAD_AAD)?;

        let mut blob = Vec::with_capacity(2 + header_ct.len() + payload_ct.len());
        blob.extend_from_slice(&(header_ct.len() as u16).to_be_bytes());
        blob.extend_from_slice(&header_ct);
        blob.extend_from_slice(&payload_ct);

        // Commit.
        self.send_tag_key = next_tag_key;
        self.send_tag_index += 1;
        self.cks = Some(next_cks);
        self.ns += 1;

        Ok(SendStep { tag, blob })
    }

    /// Opens a blob that arrived at `tag`.
    ///
    /// Failures never advance state.
    ///
    /// # Errors
    ///
    /// - [`RvChatError::UnknownTag`] — `tag` is not in the expected
    ///   window (already consumed, or not ours).
    /// - [`RvChatError::OutOfOrder`] — the message is further ahead of
    ///   the receiving chain than the skipped-key window allows, or its
    ///   key was already evicted from the cache.
    /// - [`RvChatError::Crypto`] — MAC failure on header or payload.
    /// - [`RvChatError::Malformed`] — blob framing or header parse
    ///   failure.
    pub fn open(&mut self, tag: &RvTag, blob: &[u8]) -> Result<Vec<u8>> {
        // Work on a copy; commit only on success.
        let mut next = self.clone();
        let plaintext = next.open_inner(tag, blob)?;
        *self = next;
        Ok(plaintext)
    }

    fn open_inner(&mut self, tag: &RvTag, blob: &[u8]) -> Result<Vec<u8>> {
        let entry_pos = self
            .recv_window
            .iter()
            .position(|e| &e.tag == tag)
            .ok_or_else(|| RvChatError::UnknownTag {
                reason: format!("tag {tag} not in expected receive window"),
            })?;
        let entry = self.recv_window[entry_pos].clone();

        let (header_ct, payload_ct) = split_blob(blob)?;
        let header_bytes = aead::decrypt(&entry.header_key, &entry.header_nonce, header_ct, HEADER_AAD)?;
        let header: Header =
            serde_json::from_slice(&header_bytes).map_err(|e| RvChatError::Malformed {
                reason: format!("header decoding failed: {e}"),
            })?;

        // A cached skipped key (current chain or a sealed previous
        // chain) is tried before anything else, so stragglers never
        // trigger a spurious DH step.
        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.dh_pub == header.dh_pub && s.counter == header.counter)
        {
            let s = self.skipped.remove(pos).unwrap();
            let plaintext = aead::decrypt(&s.message_key, &s.nonce, payload_ct, PAYLOAD_AAD)?;
            self.recv_window.remove(entry_pos);
            self.fill_recv_window()?;
            return Ok(plaintext);
        }

        // A ratchet public key we have not seen announces a DH step.
        if self.dhr != Some(header.dh_pub) {
            self.dh_step(&header)?;
        }

        let (message_key, msg_nonce) = self.message_key_for(&header)?;
        let plaintext = aead::decrypt(&message_key, &msg_nonce, payload_ct, PAYLOAD_AAD)?;

        // Consume the tag and keep the look-ahead full.
        self.recv_window.remove(entry_pos);
        self.fill_recv_window()?;

        Ok(plaintext)
    }

    /// Resolves the message key for a decrypted header, skipping and
    /// caching intermediate keys as needed. The skipped cache has
    /// already been consulted by the caller.
    fn message_key_for(&mut self, header: &Header) -> Result<([u8; 32], [u8; 24])> {
        // Behind the chain with no cached key: the key was evicted or
        // the message is a replay.
        if header.counter < self.nr {
            return Err(RvChatError::OutOfOrder {
                reason: format!(
                    "counter {} behind chain position {} and not cached",
                    header.counter, self.nr
                ),
            });
        }

        let ahead = header.counter - self.nr;
        if ahead as usize > self.config.window {
            return Err(RvChatError::OutOfOrder {
                reason: format!(
                    "counter {} is {} ahead of chain position {}, window {}",
                    header.counter, ahead, self.nr, self.config.window
                ),
            });
        }

        let dhr = header.dh_pub;
        self.skip_to(header.counter, &dhr)?;

        let ckr = self.ckr.ok_or_else(|| RvChatError::RatchetDesync {
            reason: "receiving chain not established".into(),
        })?;
        let message_key = hkdf::derive_key(&ckr, &[], MSG_KEY_INFO)?;
        let msg_nonce = derive_nonce(&ckr, MSG_NONCE_INFO)?;
        self.ckr = Some(hkdf::derive_key(&ckr, &[], CHAIN_INFO)?);
        self.nr = header.counter + 1;

        Ok((message_key, msg_nonce))
    }

    /// Advances the receiving chain to `until`, caching each skipped
    /// key. The cache is bounded: beyond the window the oldest entry is
    /// dropped and the drop is logged.
    fn skip_to(&mut self, until: u32, dh_pub: &[u8; 32]) -> Result<()> {
        while self.nr < until {
            let ckr = self.ckr.ok_or_else(|| RvChatError::RatchetDesync {
                reason: "receiving chain not established".into(),
            })?;
            let message_key = hkdf::derive_key(&ckr, &[], MSG_KEY_INFO)?;
            let nonce = derive_nonce(&ckr, MSG_NONCE_INFO)?;
            self.ckr = Some(hkdf::derive_key(&ckr, &[], CHAIN_INFO)?);

            self.skipped.push_back(SkippedKey {
                dh_pub: *dh_pub,
                counter: self.nr,
                message_key,
                nonce,
            });
            if self.skipped.len() > self.config.window {
                let dropped = self.skipped.pop_front().unwrap();
                tracing::warn!(
                    counter = dropped.counter,
                    "skipped-key window full, dropping oldest cached key"
                );
            }
            self.nr += 1;
        }
        Ok(())
    }

    /// Performs a DH step: seals the current receiving chain (caching
    /// its remaining keys up to the announced previous chain length),
    /// opens the new receiving chain, and rotates our own sending pair.
    fn dh_step(&mut self, header: &Header) -> Result<()> {
        // Seal the outgoing receiving chain.
        if self.ckr.is_some() {
            let old_dhr = self.dhr.ok_or_else(|| RvChatError::RatchetDesync {
                reason: "receiving chain without remote ratchet key".into(),
            })?;
            if header.prev_chain_len > self.nr
                && (header.prev_chain_len - self.nr) as usize > self.config.window
            {
                return Err(RvChatError::OutOfOrder {
                    reason: format!(
                        "previous chain left {} unreceived messages, window {}",
                        header.prev_chain_len - self.nr,
                        self.config.window
                    ),
                });
            }
            self.skip_to(header.prev_chain_len, &old_dhr)?;
        }

        // New receiving chain keyed by their new public.
        let (root_key, ckr) = root_step(&self.root_key, &self.dhs.diffie_hellman(&header.dh_pub)?)?;
        self.root_key = root_key;
        self.ckr = Some(ckr);
        self.dhr = Some(header.dh_pub);
        self.nr = 0;

        // Rotate our sending pair and chain.
        self.pn = self.ns;
        self.ns = 0;
        self.dhs = DhKeyPair::generate();
        let (root_key, cks) = root_step(&self.root_key, &self.dhs.diffie_hellman(&header.dh_pub)?)?;
        self.root_key = root_key;
        self.cks = Some(cks);

        Ok(())
    }

    /// Tops the receive-tag look-ahead back up to the window size.
    fn fill_recv_window(&mut self) -> Result<()> {
        while self.recv_window.len() < self.config.window {
            let tag = RvTag::new(hkdf::derive_key(&self.recv_tag_key, &[], TAG_INFO)?);
            let header_key = hkdf::derive_key(&self.recv_tag_key, &[], HEADER_KEY_INFO)?;
            let header_nonce = derive_nonce(&self.recv_tag_key, HEADER_NONCE_INFO)?;

            self.recv_window.push_back(RecvTag {
                index: self.recv_tag_index,
                tag,
                header_key,
                header_nonce,
            });

            self.recv_tag_key = hkdf::derive_key(&self.recv_tag_key, &[], TAG_CHAIN_INFO)?;
            self.recv_tag_index += 1;
        }

        // Oldest stale tags fall off once the window moves past them.
        while self.recv_window.len() > self.config.window {
            let dropped = self.recv_window.pop_front().unwrap();
            tracing::warn!(index = dropped.index, tag = %dropped.tag, "dropping stale receive tag");
        }
        Ok(())
    }
}

// Ratchet intentionally has no Debug impl: chain keys must not end up
// in logs.

// ---------------------------------------------------------------------------
// Derivation helpers
// ---------------------------------------------------------------------------

/// KDF_RK: mixes a DH output into the root key, producing the next
/// root key and a fresh chain key.
fn root_step(root_key: &[u8; 32], dh_out: &[u8; 32]) -> Result<([u8; 32], [u8; 32])> {
    let out = hkdf::hkdf_sha256(dh_out, root_key, ROOT_STEP_INFO, 64)?;
    let bytes = out.as_bytes();
    let mut next_root = [0u8; 32];
    let mut chain = [0u8; 32];
    next_root.copy_from_slice(&bytes[..32]);
    chain.copy_from_slice(&bytes[32..]);
    Ok((next_root, chain))
}

fn derive_nonce(ikm: &[u8; 32], info: &[u8]) -> Result<[u8; 24]> {
    let out = hkdf::hkdf_sha256(ikm, &[], info, 24)?;
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(out.as_bytes());
    Ok(nonce)
}

fn split_blob(blob: &[u8]) -> Result<(&[u8], &[u8])> {
    if blob.len() < 2 {
        return Err(RvChatError::Malformed {
            reason: "blob shorter than header length prefix".into(),
        });
    }
    let header_len = u16::from_be_bytes([blob[0], blob[1]]) as usize;
    if blob.len() < 2 + header_len {
        return Err(RvChatError::Malformed {
            reason: format!(
                "blob length {} shorter than declared header {}",
                blob.len(),
                header_len
            ),
        });
    }
    Ok((&blob[2..2 + header_len], &blob[2 + header_len..]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
