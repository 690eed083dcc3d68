// Request authentication
//
// Every signing request carries a signature made by the baker's authorized
// key. The signed message binds the request to this signer and to the exact
// payload bytes, so it cannot be replayed elsewhere.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use tracing::debug;

use crate::codec::{
    self, CodecError, PUBLIC_KEY_HASH_LENGTH, SECP256K1_PUBLIC_KEY_PREFIX,
    SECP256K1_SIGNATURE_PREFIX,
};

/// Leading bytes of every authentication message
pub const AUTHENTICATION_MAGIC: [u8; 3] = [0x04, 0x01, 0x01];

/// Errors that can occur while authenticating a request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized(&'static str),
}

/// The baker-side key allowed to submit signing requests
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    public_key: PublicKey,
    address: String,
}

impl AuthorizedKey {
    /// Parse an `sppk...` encoded public key
    pub fn from_encoded(encoded: &str) -> Result<Self, CodecError> {
        let bytes = codec::base58check_decode(encoded, &SECP256K1_PUBLIC_KEY_PREFIX)?;
        let public_key = PublicKey::from_slice(&bytes).map_err(|_| CodecError::InvalidLength {
            expected: codec::COMPRESSED_POINT_LENGTH,
            actual: bytes.len(),
        })?;
        Ok(Self::from_public_key(public_key))
    }

    pub fn from_public_key(public_key: PublicKey) -> Self {
        let address = codec::public_key_hash(&public_key.serialize());
        Self {
            public_key,
            address,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// `tz2...` address of the key
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Verifies authentication signatures against the authorized key
pub struct RequestAuthenticator {
    secp: Secp256k1<VerifyOnly>,
    authorized_key: AuthorizedKey,
}

impl RequestAuthenticator {
    pub fn new(authorized_key: AuthorizedKey) -> Self {
        Self {
            secp: Secp256k1::verification_only(),
            authorized_key,
        }
    }

    pub fn authorized_key(&self) -> &AuthorizedKey {
        &self.authorized_key
    }

    /// Build `magic || signer address bytes || payload`
    pub fn canonical_message(
        signer_address: &[u8; PUBLIC_KEY_HASH_LENGTH],
        payload: &[u8],
    ) -> Vec<u8> {
        let prefixed = codec::merge_bytes(&AUTHENTICATION_MAGIC, signer_address);
        codec::merge_bytes(&prefixed, payload)
    }

    /// Check that `authentication` is the authorized key's signature over the
    /// canonical message for `signer_address` and `payload`.
    pub fn verify(
        &self,
        signer_address: &str,
        payload: &[u8],
        authentication: &str,
    ) -> Result<(), AuthError> {
        let signer_bytes = codec::decode_public_key_hash(signer_address)
            .map_err(|_| AuthError::Unauthorized("signer address is not a tz2 address"))?;
        let signature_bytes = codec::base58check_decode(authentication, &SECP256K1_SIGNATURE_PREFIX)
            .map_err(|_| AuthError::Unauthorized("authentication is not an spsig1 signature"))?;
        let signature = Signature::from_compact(&signature_bytes)
            .map_err(|_| AuthError::Unauthorized("malformed authentication signature"))?;

        let digest = codec::blake2b_256(&Self::canonical_message(&signer_bytes, payload));
        let message = Message::from_digest(digest);

        self.secp
            .verify_ecdsa(&message, &signature, &self.authorized_key.public_key)
            .map_err(|e| {
                debug!(error = %e, "authentication signature rejected");
                AuthError::Unauthorized("signature does not match the authorized key")
            })
    }
}
