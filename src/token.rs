//! Content-derived idempotency tokens.
//!
//! A token is a keyed BLAKE2b-256 digest over the padded report body. The
//! key is a subkey of the report key, so identical narratives collapse to the
//! same token while observers without the key learn nothing about content.

use blake2::digest::{consts::U32, Digest};
use blake2::Blake2b;
use std::fmt;

const TOKEN_DOMAIN: &[u8] = b"INCIDENT_LEDGER_TOKEN_V1";

/// Byte length of an idempotency token.
pub const TOKEN_LEN: usize = 32;

/// Deterministic identifier that collapses duplicate submissions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyToken([u8; TOKEN_LEN]);

impl IdempotencyToken {
    /// Derives the token for `body` under the given token subkey and key id.
    pub fn derive(subkey: &[u8; 32], key_id: u32, body: &[u8]) -> Self {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(TOKEN_DOMAIN);
        hasher.update(subkey);
        hasher.update(key_id.to_be_bytes());
        hasher.update((body.len() as u64).to_be_bytes());
        hasher.update(body);
        let mut out = [0u8; TOKEN_LEN];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a token from a slice, returning `None` on length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; TOKEN_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parses a hex-encoded token.
    pub fn from_hex(input: &str) -> Option<Self> {
        let bytes = hex::decode(input.trim().trim_start_matches("0x")).ok()?;
        Self::from_slice(&bytes)
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyToken({}…)", &self.to_hex()[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_depends_on_key_and_body() {
        let a = IdempotencyToken::derive(&[1u8; 32], 7, b"theft at warehouse 4");
        let b = IdempotencyToken::derive(&[1u8; 32], 7, b"theft at warehouse 4");
        let other_key = IdempotencyToken::derive(&[2u8; 32], 7, b"theft at warehouse 4");
        let other_body = IdempotencyToken::derive(&[1u8; 32], 7, b"theft at warehouse 5");
        assert_eq!(a, b);
        assert_ne!(a, other_key);
        assert_ne!(a, other_body);
    }

    #[test]
    fn hex_roundtrip() {
        let token = IdempotencyToken::derive(&[9u8; 32], 1, b"x");
        assert_eq!(IdempotencyToken::from_hex(&token.to_hex()), Some(token));
        assert_eq!(IdempotencyToken::from_hex("abcd"), None);
    }
}
