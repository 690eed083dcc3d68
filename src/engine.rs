//! Signing engine
//!
//! Drives one signing request through
//! `Received -> Authenticated -> Parsed -> WatermarkChecked -> Signed -> Committed`.
//! Any step can end the request. The watermark is only written after a
//! signature exists, and a signature is only returned after its watermark
//! write succeeded.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use tracing::{debug, error, info, warn};

use crate::auth::RequestAuthenticator;
use crate::backend::{BackendError, RawSignature, SigningBackend};
use crate::codec::{self, PUBLIC_KEY_HASH_LENGTH};
use crate::config::Timeouts;
use crate::error::{Result, SignerError};
use crate::operation::{self, ConsensusPosition, OperationKind, ParsedOperation};
use crate::watermark::{WatermarkError, WatermarkStore};

/// Where a signing request stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStage {
    Received,
    Authenticated,
    Parsed,
    WatermarkChecked,
    Signed,
    Committed,
}

/// The consensus key this signer serves
#[derive(Debug, Clone)]
pub struct SignerIdentity {
    public_key: PublicKey,
    encoded_public_key: String,
    address: String,
    address_bytes: [u8; PUBLIC_KEY_HASH_LENGTH],
}

impl SignerIdentity {
    pub fn from_public_key(public_key: PublicKey) -> Self {
        let compressed = public_key.serialize();
        Self {
            public_key,
            encoded_public_key: codec::encode_public_key(&compressed),
            address: codec::public_key_hash(&compressed),
            address_bytes: codec::blake2b_160(&compressed),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// `sppk...` encoding of the public key
    pub fn encoded_public_key(&self) -> &str {
        &self.encoded_public_key
    }

    /// `tz2...` address
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn address_bytes(&self) -> &[u8; PUBLIC_KEY_HASH_LENGTH] {
        &self.address_bytes
    }
}

/// Outcome of a committed signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedOperation {
    pub kind: OperationKind,
    pub position: ConsensusPosition,
    /// `spsig1...` encoded signature
    pub signature: String,
}

/// Reject anything that is not strictly above the current watermark.
///
/// An equal round at an equal level is a violation, which also rejects a
/// byte-identical replay.
pub fn check_high_watermark(
    kind: OperationKind,
    requested: ConsensusPosition,
    current: ConsensusPosition,
) -> Result<()> {
    if requested.level < current.level
        || (requested.level == current.level && requested.round <= current.round)
    {
        return Err(SignerError::HighWatermarkViolation {
            kind,
            requested,
            current,
        });
    }
    Ok(())
}

/// Decode a backend signature to compact `r || s` with `s` in the lower half
/// of the curve order.
pub fn normalize_signature(raw: &RawSignature) -> Result<[u8; 64]> {
    let mut signature = match raw {
        RawSignature::Der(der) => Signature::from_der(der).map_err(|e| {
            BackendError::MalformedResponse(format!("undecodable DER signature: {}", e))
        })?,
        RawSignature::Compact(bytes) => Signature::from_compact(bytes).map_err(|e| {
            BackendError::MalformedResponse(format!("signature scalars out of range: {}", e))
        })?,
    };
    signature.normalize_s();
    Ok(signature.serialize_compact())
}

async fn bounded<T, E, F>(limit: Duration, what: &'static str, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    SignerError: From<E>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(SignerError::from),
        Err(_) => Err(SignerError::Timeout(what)),
    }
}

/// Signs consensus operations for one identity under high watermark protection
pub struct SigningEngine {
    identity: SignerIdentity,
    authenticator: RequestAuthenticator,
    backend: Arc<dyn SigningBackend>,
    store: Arc<dyn WatermarkStore>,
    timeouts: Timeouts,
}

impl fmt::Debug for SigningEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningEngine")
            .field("signer", &self.identity.address)
            .field("authorized", &self.authenticator.authorized_key().address())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl SigningEngine {
    /// Create an engine, resolving the signer identity from the backend's
    /// public key.
    pub async fn new(
        backend: Arc<dyn SigningBackend>,
        store: Arc<dyn WatermarkStore>,
        authenticator: RequestAuthenticator,
        timeouts: Timeouts,
    ) -> Result<Self> {
        let public_key = bounded(timeouts.oracle, "signing oracle", backend.public_key()).await?;
        let identity = SignerIdentity::from_public_key(public_key);
        info!(
            "Signer {} ready ({}), authorized key {}",
            identity.address,
            identity.encoded_public_key,
            authenticator.authorized_key().address()
        );

        Ok(Self {
            identity,
            authenticator,
            backend,
            store,
            timeouts,
        })
    }

    pub fn identity(&self) -> &SignerIdentity {
        &self.identity
    }

    pub fn authenticator(&self) -> &RequestAuthenticator {
        &self.authenticator
    }

    /// Sign `payload` for `signer_address` if authenticated and above the
    /// high watermark.
    pub async fn sign(
        &self,
        signer_address: &str,
        payload: &[u8],
        authentication: &str,
    ) -> Result<SignedOperation> {
        let mut stage = SigningStage::Received;
        let mut parsed: Option<ParsedOperation> = None;
        let result = self
            .run(signer_address, payload, authentication, &mut stage, &mut parsed)
            .await;

        match &result {
            Ok(signed) => info!(
                signer = %self.identity.address,
                "Signed {} of level {}, round {}.",
                signed.kind,
                signed.position.level,
                signed.position.round
            ),
            Err(e) => {
                let kind = parsed.map(|op| op.kind);
                let position = parsed.map(|op| op.position);
                if e.status_code() >= 500 {
                    error!(
                        signer = %signer_address,
                        ?stage,
                        ?kind,
                        ?position,
                        error_kind = ?e.kind(),
                        "Signing failed: {}",
                        e
                    );
                } else {
                    warn!(
                        signer = %signer_address,
                        ?stage,
                        ?kind,
                        ?position,
                        error_kind = ?e.kind(),
                        "Signing refused: {}",
                        e
                    );
                }
            }
        }
        result
    }

    async fn run(
        &self,
        signer_address: &str,
        payload: &[u8],
        authentication: &str,
        stage: &mut SigningStage,
        parsed: &mut Option<ParsedOperation>,
    ) -> Result<SignedOperation> {
        if signer_address != self.identity.address {
            return Err(SignerError::NotFound);
        }

        self.authenticator
            .verify(&self.identity.address, payload, authentication)?;
        *stage = SigningStage::Authenticated;

        let op = operation::parse_operation(payload)?;
        *parsed = Some(op);
        *stage = SigningStage::Parsed;

        let current = bounded(
            self.timeouts.store,
            "watermark store",
            self.store.read(&self.identity.address, op.kind),
        )
        .await?;
        if let Err(e) = check_high_watermark(op.kind, op.position, current) {
            warn!(
                "Rejecting {} at ({}): high watermark is ({})",
                op.kind, op.position, current
            );
            return Err(e);
        }
        *stage = SigningStage::WatermarkChecked;

        let digest = codec::blake2b_256(payload);
        let raw = bounded(
            self.timeouts.oracle,
            "signing oracle",
            self.backend.sign_digest(&digest),
        )
        .await?;
        let signature = normalize_signature(&raw)?;
        *stage = SigningStage::Signed;
        debug!("Signature computed for {} at ({})", op.kind, op.position);

        let committed = bounded(
            self.timeouts.store,
            "watermark store",
            self.store
                .write(&self.identity.address, op.kind, op.position, current),
        )
        .await;
        match committed {
            Ok(()) => {}
            Err(SignerError::Watermark(WatermarkError::ConcurrencyConflict { .. })) => {
                // the signature computed above is dropped here, never returned
                return Err(SignerError::MutualExclusionViolation {
                    kind: op.kind,
                    position: op.position,
                });
            }
            Err(e) => return Err(e),
        }
        *stage = SigningStage::Committed;

        Ok(SignedOperation {
            kind: op.kind,
            position: op.position,
            signature: codec::encode_signature(&signature),
        })
    }
}
