pub mod auth;
pub mod backend;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod operation;
pub mod router;
pub mod watermark;

// Re-export commonly used types for convenience
pub use engine::{SignedOperation, SignerIdentity, SigningEngine};
pub use error::{ErrorKind, Result, SignerError};
pub use operation::{ConsensusPosition, OperationKind};
pub use router::{HttpMethod, HttpRequest, HttpResponse, SignerRouter};
