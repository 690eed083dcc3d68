//! Encoding primitives for secp256k1 keys and signatures
//!
//! Addresses, public keys and signatures travel as base58check strings:
//! `base58(prefix || payload || sha256(sha256(prefix || payload))[..4])`.
//! The prefix bytes select the human-readable lead (`tz2`, `sppk`, `spsig1`).

use blake2::digest::consts::{U20, U32};
use blake2::{Blake2b, Digest};

/// Prefix of a base58check-encoded secp256k1 public key (`sppk`)
pub const SECP256K1_PUBLIC_KEY_PREFIX: [u8; 4] = [3, 254, 226, 86];

/// Prefix of a base58check-encoded secp256k1 public key hash (`tz2`)
pub const SECP256K1_PUBLIC_KEY_HASH_PREFIX: [u8; 3] = [6, 161, 161];

/// Prefix of a base58check-encoded secp256k1 signature (`spsig1`)
pub const SECP256K1_SIGNATURE_PREFIX: [u8; 5] = [13, 115, 101, 19, 63];

pub const PUBLIC_KEY_HASH_LENGTH: usize = 20;
pub const COMPRESSED_POINT_LENGTH: usize = 33;
pub const UNCOMPRESSED_POINT_LENGTH: usize = 65;

/// Errors raised while decoding keys, signatures and payloads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid base58 string: {0}")]
    InvalidBase58(String),

    #[error("Invalid prefix. Expected {expected}. Only keys of type secp256k1 are supported.")]
    InvalidPrefix { expected: String },

    #[error("Invalid checksum")]
    InvalidChecksum,

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid compression byte: {0:#04x}")]
    InvalidMarker(u8),

    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// Concatenate two byte strings
pub fn merge_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    merged.extend_from_slice(a);
    merged.extend_from_slice(b);
    merged
}

/// Encode `payload` behind `prefix` as a base58check string
pub fn base58check_encode(payload: &[u8], prefix: &[u8]) -> String {
    bs58::encode(merge_bytes(prefix, payload))
        .with_check()
        .into_string()
}

/// Decode a base58check string and strip `expected_prefix`
///
/// Fails if the checksum does not match or if the decoded bytes do not start
/// with exactly `expected_prefix`.
pub fn base58check_decode(encoded: &str, expected_prefix: &[u8]) -> Result<Vec<u8>, CodecError> {
    let data = bs58::decode(encoded)
        .with_check(None)
        .into_vec()
        .map_err(|e| match e {
            bs58::decode::Error::InvalidChecksum { .. } | bs58::decode::Error::NoChecksum => {
                CodecError::InvalidChecksum
            }
            other => CodecError::InvalidBase58(other.to_string()),
        })?;

    if !data.starts_with(expected_prefix) {
        return Err(CodecError::InvalidPrefix {
            expected: hex::encode(expected_prefix),
        });
    }

    Ok(data[expected_prefix.len()..].to_vec())
}

/// Decode a hex string into bytes
pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>, CodecError> {
    hex::decode(input).map_err(|e| CodecError::InvalidHex(e.to_string()))
}

/// Compress a 65-byte uncompressed curve point (`04 || x || y`)
///
/// The leading byte of the result is `02` for an even `y`, `03` for an odd one.
pub fn compress_point(uncompressed: &[u8]) -> Result<[u8; COMPRESSED_POINT_LENGTH], CodecError> {
    if uncompressed.len() != UNCOMPRESSED_POINT_LENGTH {
        return Err(CodecError::InvalidLength {
            expected: UNCOMPRESSED_POINT_LENGTH,
            actual: uncompressed.len(),
        });
    }
    if uncompressed[0] != 0x04 {
        return Err(CodecError::InvalidMarker(uncompressed[0]));
    }

    let mut compressed = [0u8; COMPRESSED_POINT_LENGTH];
    compressed[0] = if uncompressed[64] % 2 == 0 { 0x02 } else { 0x03 };
    compressed[1..].copy_from_slice(&uncompressed[1..33]);
    Ok(compressed)
}

/// Blake2b with a 32-byte output, the digest every signature is made over
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    Blake2b::<U32>::new().chain_update(data).finalize().into()
}

/// Blake2b with a 20-byte output, used for public key hashes
pub fn blake2b_160(data: &[u8]) -> [u8; PUBLIC_KEY_HASH_LENGTH] {
    Blake2b::<U20>::new().chain_update(data).finalize().into()
}

/// `sppk...` encoding of a compressed public key
pub fn encode_public_key(compressed: &[u8; COMPRESSED_POINT_LENGTH]) -> String {
    base58check_encode(compressed, &SECP256K1_PUBLIC_KEY_PREFIX)
}

/// `tz2...` address of a compressed public key
pub fn public_key_hash(compressed: &[u8; COMPRESSED_POINT_LENGTH]) -> String {
    base58check_encode(&blake2b_160(compressed), &SECP256K1_PUBLIC_KEY_HASH_PREFIX)
}

/// Raw hash bytes behind a `tz2...` address
pub fn decode_public_key_hash(address: &str) -> Result<[u8; PUBLIC_KEY_HASH_LENGTH], CodecError> {
    let bytes = base58check_decode(address, &SECP256K1_PUBLIC_KEY_HASH_PREFIX)?;
    bytes.as_slice().try_into().map_err(|_| CodecError::InvalidLength {
        expected: PUBLIC_KEY_HASH_LENGTH,
        actual: bytes.len(),
    })
}

/// `spsig1...` encoding of a compact `r || s` signature
pub fn encode_signature(raw: &[u8; 64]) -> String {
    base58check_encode(raw, &SECP256K1_SIGNATURE_PREFIX)
}
