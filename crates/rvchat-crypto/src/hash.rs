//! SHA-256 digests.

use sha2::{Digest, Sha256};

/// Computes SHA-256 over `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes SHA-256 over the concatenation of several slices.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_matches_known_digest() {
        // SHA-256 of the empty string.
        let expected =
            hex::decode("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
                .unwrap();
        assert_eq!(sha256(b"").as_slice(), expected.as_slice());
    }

    #[test]
    fn concat_equals_joined() {
        assert_eq!(sha256_concat(&[b"ab", b"cd"]), sha256(b"abcd"));
    }
}
