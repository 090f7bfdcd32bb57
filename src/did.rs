//! Deterministic, invertible mapping between ed25519 public keys and
//! `did:sight:hoster:` identifier strings.
//!
//! The encoded payload is the two-byte multicodec prefix for ed25519 public
//! keys (`0xED 0x01`) followed by the 32 raw key bytes, rendered in base58.
//! Encoding is total and injective; decoding rejects anything that does not
//! reconstruct an exact original key.

use thiserror::Error;

/// Scheme literal prepended to every encoded key.
pub const DID_PREFIX: &str = "did:sight:hoster:";

/// Multicodec prefix marking the wrapped bytes as an ed25519 public key.
pub const ED25519_MULTICODEC: [u8; 2] = [0xED, 0x01];

/// Length of a raw ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Errors produced while decoding a DID string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DidError {
    /// The scheme prefix is absent or the payload is not valid base58.
    #[error("not a valid sight DID: {0}")]
    MalformedDid(String),
    /// The decoded payload is not `prefix(2) + key(32)` bytes with the
    /// ed25519 multicodec prefix.
    #[error("not a valid ed25519 encoded key (decoded {0} bytes)")]
    InvalidKeyEncoding(usize),
}

/// Encodes a raw public key as a sight DID.
pub fn public_key_to_did(public_key: &[u8]) -> String {
    let mut payload = Vec::with_capacity(ED25519_MULTICODEC.len() + public_key.len());
    payload.extend_from_slice(&ED25519_MULTICODEC);
    payload.extend_from_slice(public_key);
    format!("{DID_PREFIX}{}", bs58::encode(payload).into_string())
}

/// Decodes a sight DID back to the exact original public key bytes.
pub fn did_to_public_key(did: &str) -> Result<Vec<u8>, DidError> {
    let encoded = did
        .strip_prefix(DID_PREFIX)
        .ok_or_else(|| DidError::MalformedDid(did.to_string()))?;
    let decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| DidError::MalformedDid(did.to_string()))?;
    if decoded.len() != ED25519_MULTICODEC.len() + PUBLIC_KEY_LEN
        || decoded[..2] != ED25519_MULTICODEC
    {
        return Err(DidError::InvalidKeyEncoding(decoded.len()));
    }
    Ok(decoded[2..].to_vec())
}
