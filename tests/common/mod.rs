#![allow(dead_code)]

use std::sync::Arc;

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use consensus_signer::auth::{AuthorizedKey, RequestAuthenticator};
use consensus_signer::backend::{LocalKeyBackend, SigningBackend};
use consensus_signer::codec;
use consensus_signer::config::Timeouts;
use consensus_signer::watermark::WatermarkStore;
use consensus_signer::{HttpMethod, HttpRequest, SignerRouter, SigningEngine};

pub const SECRET: &str = "c0ffee";

pub fn signer_secret() -> SecretKey {
    SecretKey::from_slice(&[0x42; 32]).unwrap()
}

pub fn baker_secret() -> SecretKey {
    SecretKey::from_slice(&[0x24; 32]).unwrap()
}

pub fn baker_key() -> AuthorizedKey {
    AuthorizedKey::from_public_key(PublicKey::from_secret_key(&Secp256k1::new(), &baker_secret()))
}

/// Authentication token the baker attaches to a signing request
pub fn authenticate(signer_address: &str, payload: &[u8]) -> String {
    let signer_bytes = codec::decode_public_key_hash(signer_address).unwrap();
    let digest = codec::blake2b_256(&RequestAuthenticator::canonical_message(
        &signer_bytes,
        payload,
    ));
    let signature = Secp256k1::new().sign_ecdsa(&Message::from_digest(digest), &baker_secret());
    codec::encode_signature(&signature.serialize_compact())
}

/// Block header whose 4-byte fitness is the round itself
pub fn block(level: u32, round: u32) -> Vec<u8> {
    let mut data = vec![0x11, 0x7a, 0x06, 0xa7, 0x70];
    data.extend_from_slice(&level.to_be_bytes());
    data.resize(83, 0x5a);
    data.extend_from_slice(&4u32.to_be_bytes());
    data.extend_from_slice(&round.to_be_bytes());
    data.extend_from_slice(&[0x01; 32]);
    data
}

pub fn attestation(magic: u8, level: u32, round: u32) -> Vec<u8> {
    let mut data = vec![magic];
    data.resize(40, 0x33);
    data.extend_from_slice(&level.to_be_bytes());
    data.extend_from_slice(&round.to_be_bytes());
    data.extend_from_slice(&[0x02; 32]);
    data
}

pub async fn engine(
    backend: Arc<dyn SigningBackend>,
    store: Arc<dyn WatermarkStore>,
    timeouts: Timeouts,
) -> Arc<SigningEngine> {
    let engine = SigningEngine::new(backend, store, RequestAuthenticator::new(baker_key()), timeouts)
        .await
        .unwrap();
    Arc::new(engine)
}

pub async fn local_router(store: Arc<dyn WatermarkStore>) -> SignerRouter {
    let backend = Arc::new(LocalKeyBackend::new(signer_secret()));
    SignerRouter::new(SECRET, engine(backend, store, Timeouts::default()).await)
}

/// Authenticated `POST /{secret}/keys/{address}` for `payload`
pub fn sign_request(address: &str, payload: &[u8]) -> HttpRequest {
    HttpRequest::new(HttpMethod::Post, format!("/{}/keys/{}", SECRET, address))
        .with_query("authentication", authenticate(address, payload))
        .with_body(format!("\"{}\"", hex::encode(payload)))
}
