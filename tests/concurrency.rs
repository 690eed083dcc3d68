mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secp256k1::PublicKey;
use tokio::sync::Barrier;

use common::{attestation, authenticate, block, engine, signer_secret};
use consensus_signer::backend::{BackendError, LocalKeyBackend, RawSignature, SigningBackend};
use consensus_signer::config::Timeouts;
use consensus_signer::watermark::{
    FileWatermarkStore, InMemoryWatermarkStore, WatermarkError, WatermarkStore,
};
use consensus_signer::{ConsensusPosition, OperationKind, SignerError};
use tempfile::TempDir;

/// Holds every signature until `parties` requests have reached the backend,
/// so they all read the watermark before any of them writes it.
struct GatedBackend {
    inner: LocalKeyBackend,
    gate: Barrier,
}

#[async_trait]
impl SigningBackend for GatedBackend {
    async fn public_key(&self) -> Result<PublicKey, BackendError> {
        self.inner.public_key().await
    }

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<RawSignature, BackendError> {
        self.gate.wait().await;
        self.inner.sign_digest(digest).await
    }
}

/// Never answers within any reasonable timeout
struct StalledBackend {
    inner: LocalKeyBackend,
}

#[async_trait]
impl SigningBackend for StalledBackend {
    async fn public_key(&self) -> Result<PublicKey, BackendError> {
        self.inner.public_key().await
    }

    async fn sign_digest(&self, digest: &[u8; 32]) -> Result<RawSignature, BackendError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.inner.sign_digest(digest).await
    }
}

/// Commits to the file, then answers too late for the engine
struct LateStore {
    inner: FileWatermarkStore,
}

#[async_trait]
impl WatermarkStore for LateStore {
    async fn read(
        &self,
        signer: &str,
        kind: OperationKind,
    ) -> Result<ConsensusPosition, WatermarkError> {
        self.inner.read(signer, kind).await
    }

    async fn write(
        &self,
        signer: &str,
        kind: OperationKind,
        new_position: ConsensusPosition,
        expected_previous: ConsensusPosition,
    ) -> Result<(), WatermarkError> {
        self.inner
            .write(signer, kind, new_position, expected_previous)
            .await?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_racing_requests_commit_exactly_one() {
    let store = Arc::new(InMemoryWatermarkStore::new());
    let backend = Arc::new(GatedBackend {
        inner: LocalKeyBackend::new(signer_secret()),
        gate: Barrier::new(2),
    });
    let engine = engine(backend, store.clone(), Timeouts::default()).await;
    let address = engine.identity().address().to_string();

    let positions = [ConsensusPosition::new(10, 0), ConsensusPosition::new(10, 1)];
    let handles: Vec<_> = positions
        .iter()
        .map(|position| {
            let engine = engine.clone();
            let address = address.clone();
            let payload = block(position.level, position.round);
            tokio::spawn(async move {
                let token = authenticate(&address, &payload);
                engine.sign(&address, &payload, &token).await
            })
        })
        .collect();

    let mut committed = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(signed) => committed.push(signed.position),
            Err(SignerError::MutualExclusionViolation { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(committed.len(), 1);
    assert_eq!(conflicts, 1);
    let stored = store.read(&address, OperationKind::Block).await.unwrap();
    assert_eq!(stored, committed[0]);
    assert!(positions.contains(&stored));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conflict_is_reported_as_bad_request() {
    let store = Arc::new(InMemoryWatermarkStore::new());
    let backend = Arc::new(GatedBackend {
        inner: LocalKeyBackend::new(signer_secret()),
        gate: Barrier::new(2),
    });
    let engine = engine(backend, store, Timeouts::default()).await;
    let address = engine.identity().address().to_string();

    // the same attestation submitted twice at once
    let payload = attestation(0x13, 77, 2);
    let token = authenticate(&address, &payload);
    let (first, second) = tokio::join!(
        engine.sign(&address, &payload, &token),
        engine.sign(&address, &payload, &token)
    );

    let failure = match (first, second) {
        (Ok(_), Err(e)) | (Err(e), Ok(_)) => e,
        other => panic!("expected exactly one success, got {:?}", other),
    };
    assert_eq!(failure.status_code(), 400);
    assert_eq!(failure.to_string(), "High Watermark Mutual Exclusion Violation");
}

#[tokio::test]
async fn test_backend_timeout_leaves_watermark_untouched() {
    let store = Arc::new(InMemoryWatermarkStore::new());
    let backend = Arc::new(StalledBackend {
        inner: LocalKeyBackend::new(signer_secret()),
    });
    let timeouts = Timeouts {
        oracle: Duration::from_millis(50),
        store: Duration::from_millis(50),
    };
    let engine = engine(backend, store.clone(), timeouts).await;
    let address = engine.identity().address().to_string();
    let payload = block(4, 0);

    let result = engine
        .sign(&address, &payload, &authenticate(&address, &payload))
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, SignerError::Timeout(_)));
    assert_eq!(err.status_code(), 500);
    assert_eq!(
        store.read(&address, OperationKind::Block).await.unwrap(),
        ConsensusPosition::ZERO
    );
}

#[tokio::test]
async fn test_store_timeout_withholds_signature_and_keeps_watermark() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("watermarks.json");
    let store = Arc::new(LateStore {
        inner: FileWatermarkStore::open(&path).unwrap(),
    });
    let timeouts = Timeouts {
        oracle: Duration::from_secs(5),
        store: Duration::from_millis(500),
    };
    let backend = Arc::new(LocalKeyBackend::new(signer_secret()));
    let engine = engine(backend, store.clone(), timeouts).await;
    let address = engine.identity().address().to_string();
    let payload = block(15, 3);
    let token = authenticate(&address, &payload);

    let err = engine.sign(&address, &payload, &token).await.unwrap_err();
    assert!(matches!(err, SignerError::Timeout("watermark store")));
    assert_eq!(err.status_code(), 500);

    // the commit landed, so the same position can never be signed again
    let on_disk = FileWatermarkStore::open(&path)
        .unwrap()
        .read(&address, OperationKind::Block)
        .await
        .unwrap();
    assert_eq!(on_disk, ConsensusPosition::new(15, 3));
    let retry = engine.sign(&address, &payload, &token).await;
    assert!(matches!(retry, Err(SignerError::HighWatermarkViolation { .. })));
}
