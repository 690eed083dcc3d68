// Signing backends
//
// A backend signs a 32-byte digest with the consensus key. Two deployments
// exist: the key held in process memory, or the key kept by an external
// signing oracle (a KMS/HSM) that only ever sees digests.

use std::fmt;

use async_trait::async_trait;
use pkcs8::spki::{self, SubjectPublicKeyInfoRef};
use pkcs8::{DecodePublicKey, ObjectIdentifier};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use tracing::debug;

use crate::codec::{self, CodecError, UNCOMPRESSED_POINT_LENGTH};

/// Algorithm requested from the oracle; the digest is already computed.
pub const ORACLE_SIGNING_ALGORITHM: &str = "ECDSA_SHA_256";

/// Errors that can occur while talking to a signing backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Signing oracle failed: {0}")]
    Oracle(String),

    #[error("Unexpected response from signing oracle: {0}")]
    MalformedResponse(String),

    #[error("Invalid public key from signing oracle: {0}")]
    InvalidPublicKey(#[from] CodecError),

    #[error("Invalid secp256k1 secret key: {0}")]
    InvalidSecretKey(String),
}

/// A signature as returned by a backend, before normalization
#[derive(Clone, PartialEq, Eq)]
pub enum RawSignature {
    /// ASN.1 DER `SEQUENCE { r, s }`
    Der(Vec<u8>),
    /// 64-byte `r || s`
    Compact([u8; 64]),
}

impl fmt::Debug for RawSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Der(bytes) => write!(f, "Der({})", hex::encode(bytes)),
            Self::Compact(bytes) => write!(f, "Compact({})", hex::encode(bytes)),
        }
    }
}

/// `id-ecPublicKey` algorithm of an oracle's `SubjectPublicKeyInfo`
const ID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// Uncompressed point carried by an oracle's DER `SubjectPublicKeyInfo`
struct OraclePoint([u8; UNCOMPRESSED_POINT_LENGTH]);

impl TryFrom<SubjectPublicKeyInfoRef<'_>> for OraclePoint {
    type Error = spki::Error;

    fn try_from(info: SubjectPublicKeyInfoRef<'_>) -> Result<Self, spki::Error> {
        if info.algorithm.oid != ID_EC_PUBLIC_KEY {
            return Err(spki::Error::OidUnknown {
                oid: info.algorithm.oid,
            });
        }
        let point = info
            .subject_public_key
            .as_bytes()
            .ok_or(spki::Error::KeyMalformed)?;
        point.try_into().map(Self).map_err(|_| spki::Error::KeyMalformed)
    }
}

/// Request sent to a signing oracle
#[derive(Debug, Clone, Copy)]
pub struct OracleSignRequest<'a> {
    pub key_id: &'a str,
    pub digest: &'a [u8; 32],
    pub algorithm: &'static str,
    /// Always true: the oracle must not hash the digest again
    pub prehashed: bool,
}

/// External service holding the consensus private key.
#[async_trait]
pub trait SigningOracle: Send + Sync {
    /// DER `SubjectPublicKeyInfo` of the key
    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>, BackendError>;

    /// Sign a digest; the signature may come back in either raw form and
    /// with either `s`.
    async fn sign(&self, request: OracleSignRequest<'_>) -> Result<RawSignature, BackendError>;
}

/// Source of consensus signatures
#[async_trait]
pub trait SigningBackend: Send + Sync {
    async fn public_key(&self) -> Result<PublicKey, BackendError>;

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<RawSignature, BackendError>;
}

/// Consensus key held in process memory
pub struct LocalKeyBackend {
    secp: Secp256k1<All>,
    secret_key: SecretKey,
}

impl LocalKeyBackend {
    pub fn new(secret_key: SecretKey) -> Self {
        Self {
            secp: Secp256k1::new(),
            secret_key,
        }
    }

    /// Build from a hex-encoded 32-byte secret key
    pub fn from_hex(secret_key_hex: &str) -> Result<Self, BackendError> {
        let key_bytes = codec::hex_to_bytes(secret_key_hex)
            .map_err(|e| BackendError::InvalidSecretKey(e.to_string()))?;
        let secret_key = SecretKey::from_slice(&key_bytes)
            .map_err(|e| BackendError::InvalidSecretKey(e.to_string()))?;
        Ok(Self::new(secret_key))
    }
}

#[async_trait]
impl SigningBackend for LocalKeyBackend {
    async fn public_key(&self) -> Result<PublicKey, BackendError> {
        Ok(PublicKey::from_secret_key(&self.secp, &self.secret_key))
    }

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<RawSignature, BackendError> {
        let message = Message::from_digest(*digest);
        let signature = self.secp.sign_ecdsa(&message, &self.secret_key);
        Ok(RawSignature::Der(signature.serialize_der().to_vec()))
    }
}

/// Consensus key held by a [`SigningOracle`]
pub struct OracleBackend<O> {
    oracle: O,
    key_id: String,
}

impl<O: SigningOracle> OracleBackend<O> {
    pub fn new(oracle: O, key_id: impl Into<String>) -> Self {
        Self {
            oracle,
            key_id: key_id.into(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

#[async_trait]
impl<O: SigningOracle> SigningBackend for OracleBackend<O> {
    async fn public_key(&self) -> Result<PublicKey, BackendError> {
        let der = self.oracle.get_public_key(&self.key_id).await?;
        let OraclePoint(uncompressed) = OraclePoint::from_public_key_der(&der).map_err(|e| {
            BackendError::MalformedResponse(format!("invalid SubjectPublicKeyInfo: {}", e))
        })?;
        let compressed = codec::compress_point(&uncompressed)?;
        debug!("Oracle key {} resolved", self.key_id);
        PublicKey::from_slice(&compressed)
            .map_err(|e| BackendError::MalformedResponse(format!("public key not on curve: {}", e)))
    }

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<RawSignature, BackendError> {
        self.oracle
            .sign(OracleSignRequest {
                key_id: &self.key_id,
                digest,
                algorithm: ORACLE_SIGNING_ALGORITHM,
                prehashed: true,
            })
            .await
    }
}
