//! Signer configuration
//!
//! Built once at start-up and shared read-only with every request handler.
//! The daemon fills it from command-line flags, each backed by an
//! environment variable.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:6732";
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Bounds on calls to external collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub oracle: Duration,
    pub store: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            oracle: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            store: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

/// Configuration for the signer process
#[derive(Clone)]
pub struct SignerConfig {
    /// Path segment every route is nested under
    pub secret_path: String,
    /// `sppk...` key allowed to request signatures
    pub authorized_key: String,
    /// Hex-encoded consensus secret key for the in-memory backend
    pub signing_key: String,
    /// Watermark state file; in-memory watermarks when absent
    pub watermark_file: Option<PathBuf>,
    pub bind_addr: String,
    pub timeouts: Timeouts,
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("secret_path", &"<redacted>")
            .field("authorized_key", &self.authorized_key)
            .field("signing_key", &"<redacted>")
            .field("watermark_file", &self.watermark_file)
            .field("bind_addr", &self.bind_addr)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl SignerConfig {
    /// Reject values no request could ever be routed with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret_path.is_empty() || self.secret_path.contains('/') {
            return Err(ConfigError::Invalid {
                name: "SECRET_URL_PATH",
                reason: "must be a single non-empty path segment".to_string(),
            });
        }
        if self.timeouts.oracle.is_zero() || self.timeouts.store.is_zero() {
            return Err(ConfigError::Invalid {
                name: "SIGNER_TIMEOUT_MS",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
