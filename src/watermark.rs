//! High watermark storage
//!
//! The store keeps, for every `(signer address, operation kind)` pair, the
//! highest position that has been signed. Writes are compare-and-set: a write
//! only lands if the stored position still equals the one the caller read,
//! or if nothing is stored and the caller read the implicit zero position.
//! That conditional write is the only synchronization between concurrent
//! signing requests.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::operation::{ConsensusPosition, OperationKind};

/// Errors from a watermark store
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    /// The stored watermark moved since it was read
    #[error("High Watermark Mutual Exclusion Violation")]
    ConcurrencyConflict {
        signer: String,
        kind: OperationKind,
        expected: ConsensusPosition,
    },

    #[error("Watermark store unavailable: {0}")]
    Unavailable(String),

    #[error("Watermark state IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse watermark state: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Conditional key-value storage of high watermarks
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Current watermark, `ConsensusPosition::ZERO` if none was ever written
    async fn read(
        &self,
        signer: &str,
        kind: OperationKind,
    ) -> Result<ConsensusPosition, WatermarkError>;

    /// Store `new_position` if the watermark still equals `expected_previous`
    async fn write(
        &self,
        signer: &str,
        kind: OperationKind,
        new_position: ConsensusPosition,
        expected_previous: ConsensusPosition,
    ) -> Result<(), WatermarkError>;
}

fn condition_holds(stored: Option<ConsensusPosition>, expected: ConsensusPosition) -> bool {
    match stored {
        None => expected == ConsensusPosition::ZERO,
        Some(current) => current == expected,
    }
}

/// Watermarks held in process memory
///
/// Suitable for tests and for a single signer process that accepts losing its
/// watermarks on restart.
#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    entries: Mutex<HashMap<(String, OperationKind), ConsensusPosition>>,
}

impl InMemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<
        std::sync::MutexGuard<'_, HashMap<(String, OperationKind), ConsensusPosition>>,
        WatermarkError,
    > {
        self.entries
            .lock()
            .map_err(|_| WatermarkError::Unavailable("watermark lock poisoned".to_string()))
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn read(
        &self,
        signer: &str,
        kind: OperationKind,
    ) -> Result<ConsensusPosition, WatermarkError> {
        let entries = self.lock()?;
        Ok(entries
            .get(&(signer.to_string(), kind))
            .copied()
            .unwrap_or(ConsensusPosition::ZERO))
    }

    async fn write(
        &self,
        signer: &str,
        kind: OperationKind,
        new_position: ConsensusPosition,
        expected_previous: ConsensusPosition,
    ) -> Result<(), WatermarkError> {
        let mut entries = self.lock()?;
        let key = (signer.to_string(), kind);

        if !condition_holds(entries.get(&key).copied(), expected_previous) {
            return Err(WatermarkError::ConcurrencyConflict {
                signer: signer.to_string(),
                kind,
                expected: expected_previous,
            });
        }

        entries.insert(key, new_position);
        Ok(())
    }
}

/// One persisted watermark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkRecord {
    pub level: u32,
    pub round: u32,
    /// When the watermark was last advanced
    pub signed_at: DateTime<Utc>,
}

impl WatermarkRecord {
    fn position(&self) -> ConsensusPosition {
        ConsensusPosition::new(self.level, self.round)
    }
}

/// Persistent watermark state, keyed by `"<signer>/<kind>"`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatermarkState {
    pub watermarks: BTreeMap<String, WatermarkRecord>,
}

fn state_key(signer: &str, kind: OperationKind) -> String {
    format!("{}/{}", signer, kind)
}

/// Write `state` to a temp file, flush it to disk, then rename it over `path`.
fn persist(path: &Path, state: &WatermarkState) -> Result<(), WatermarkError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&serde_json::to_vec_pretty(state)?)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;

    // make the rename itself durable
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Watermarks persisted to a JSON file.
///
/// The file is rewritten atomically on every advance. Compare-and-set is
/// serialized by an in-process lock, so a state file must not be shared by
/// two signer processes.
///
/// A commit runs on its own task and keeps the lock until the file is on
/// disk. A caller that stops waiting (a timeout) does not cancel it, so the
/// file never falls behind the in-memory state.
pub struct FileWatermarkStore {
    path: PathBuf,
    state: Arc<tokio::sync::Mutex<WatermarkState>>,
}

impl FileWatermarkStore {
    /// Open the state file at `path`, starting empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WatermarkError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            info!("Loading watermark state from {:?}", path);
            let contents = fs::read(&path)?;
            serde_json::from_slice(&contents)?
        } else {
            info!("Creating new watermark state at {:?}", path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            WatermarkState::default()
        };

        Ok(Self {
            path,
            state: Arc::new(tokio::sync::Mutex::new(state)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn read(
        &self,
        signer: &str,
        kind: OperationKind,
    ) -> Result<ConsensusPosition, WatermarkError> {
        let state = self.state.lock().await;
        Ok(state
            .watermarks
            .get(&state_key(signer, kind))
            .map(WatermarkRecord::position)
            .unwrap_or(ConsensusPosition::ZERO))
    }

    async fn write(
        &self,
        signer: &str,
        kind: OperationKind,
        new_position: ConsensusPosition,
        expected_previous: ConsensusPosition,
    ) -> Result<(), WatermarkError> {
        let state = Arc::clone(&self.state);
        let path = self.path.clone();
        let signer = signer.to_string();

        let commit = tokio::spawn(async move {
            let mut state = state.lock_owned().await;
            let key = state_key(&signer, kind);
            let stored = state.watermarks.get(&key).map(WatermarkRecord::position);

            if !condition_holds(stored, expected_previous) {
                warn!(
                    "Watermark for {} moved: expected ({}), found {:?}",
                    key, expected_previous, stored
                );
                return Err(WatermarkError::ConcurrencyConflict {
                    signer,
                    kind,
                    expected: expected_previous,
                });
            }

            // Persist a copy first so a failed write leaves the in-memory state untouched.
            let mut next = state.clone();
            next.watermarks.insert(
                key.clone(),
                WatermarkRecord {
                    level: new_position.level,
                    round: new_position.round,
                    signed_at: Utc::now(),
                },
            );
            let next = tokio::task::spawn_blocking(move || persist(&path, &next).map(|()| next))
                .await
                .map_err(|e| WatermarkError::Unavailable(format!("persist task failed: {}", e)))??;
            *state = next;

            debug!("Watermark {} advanced to ({})", key, new_position);
            Ok(())
        });

        commit
            .await
            .map_err(|e| WatermarkError::Unavailable(format!("commit task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SIGNER: &str = "tz2BFTyPeYRzxd5aiBchbXN3WCZhx7BqbMBq";

    #[tokio::test]
    async fn test_memory_read_defaults_to_zero() {
        let store = InMemoryWatermarkStore::new();
        let position = store.read(SIGNER, OperationKind::Block).await.unwrap();
        assert_eq!(position, ConsensusPosition::ZERO);
    }

    #[tokio::test]
    async fn test_memory_write_then_read() {
        let store = InMemoryWatermarkStore::new();
        store
            .write(SIGNER, OperationKind::Block, ConsensusPosition::new(5, 2), ConsensusPosition::ZERO)
            .await
            .unwrap();

        assert_eq!(
            store.read(SIGNER, OperationKind::Block).await.unwrap(),
            ConsensusPosition::new(5, 2)
        );
        // kinds are tracked separately
        assert_eq!(
            store.read(SIGNER, OperationKind::Attestation).await.unwrap(),
            ConsensusPosition::ZERO
        );
    }

    #[tokio::test]
    async fn test_memory_stale_write_conflicts() {
        let store = InMemoryWatermarkStore::new();
        store
            .write(SIGNER, OperationKind::Attestation, ConsensusPosition::new(7, 0), ConsensusPosition::ZERO)
            .await
            .unwrap();

        let result = store
            .write(SIGNER, OperationKind::Attestation, ConsensusPosition::new(8, 0), ConsensusPosition::ZERO)
            .await;
        assert!(matches!(result, Err(WatermarkError::ConcurrencyConflict { .. })));
        assert_eq!(
            store.read(SIGNER, OperationKind::Attestation).await.unwrap(),
            ConsensusPosition::new(7, 0)
        );
    }

    #[tokio::test]
    async fn test_memory_absent_requires_zero_expectation() {
        let store = InMemoryWatermarkStore::new();
        let result = store
            .write(SIGNER, OperationKind::Block, ConsensusPosition::new(3, 0), ConsensusPosition::new(2, 0))
            .await;
        assert!(matches!(result, Err(WatermarkError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("watermarks.json");

        {
            let store = FileWatermarkStore::open(&path).unwrap();
            store
                .write(SIGNER, OperationKind::Preattestation, ConsensusPosition::new(10, 1), ConsensusPosition::ZERO)
                .await
                .unwrap();
        }

        let reopened = FileWatermarkStore::open(&path).unwrap();
        assert_eq!(
            reopened.read(SIGNER, OperationKind::Preattestation).await.unwrap(),
            ConsensusPosition::new(10, 1)
        );
    }

    #[tokio::test]
    async fn test_file_store_stale_write_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::open(temp_dir.path().join("watermarks.json")).unwrap();

        store
            .write(SIGNER, OperationKind::Block, ConsensusPosition::new(4, 0), ConsensusPosition::ZERO)
            .await
            .unwrap();
        let result = store
            .write(SIGNER, OperationKind::Block, ConsensusPosition::new(4, 1), ConsensusPosition::new(3, 0))
            .await;

        assert!(matches!(result, Err(WatermarkError::ConcurrencyConflict { .. })));
        assert_eq!(
            store.read(SIGNER, OperationKind::Block).await.unwrap(),
            ConsensusPosition::new(4, 0)
        );
    }

    #[tokio::test]
    async fn test_abandoned_write_keeps_file_and_memory_in_step() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("watermarks.json");
        let store = FileWatermarkStore::open(&path).unwrap();

        // the caller gives up while the commit is in flight
        let _ = tokio::time::timeout(
            std::time::Duration::ZERO,
            store.write(SIGNER, OperationKind::Block, ConsensusPosition::new(9, 0), ConsensusPosition::ZERO),
        )
        .await;
        let second = store
            .write(SIGNER, OperationKind::Block, ConsensusPosition::new(9, 1), ConsensusPosition::ZERO)
            .await;

        let in_memory = store.read(SIGNER, OperationKind::Block).await.unwrap();
        match second {
            Ok(()) => assert_eq!(in_memory, ConsensusPosition::new(9, 1)),
            Err(WatermarkError::ConcurrencyConflict { .. }) => {
                assert_eq!(in_memory, ConsensusPosition::new(9, 0))
            }
            Err(e) => panic!("unexpected error: {}", e),
        }

        let on_disk = FileWatermarkStore::open(&path)
            .unwrap()
            .read(SIGNER, OperationKind::Block)
            .await
            .unwrap();
        assert_eq!(on_disk, in_memory);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_open_rejects_corrupt_state() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("watermarks.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            FileWatermarkStore::open(&path),
            Err(WatermarkError::Parse(_))
        ));
    }
}
