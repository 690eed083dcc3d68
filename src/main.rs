//! Remote consensus signer daemon.
//!
//! Serves the signing router over HTTP. Every route is nested under the secret
//! path segment; see [`consensus_signer::router`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use consensus_signer::auth::{AuthorizedKey, RequestAuthenticator};
use consensus_signer::backend::LocalKeyBackend;
use consensus_signer::config::{SignerConfig, Timeouts, DEFAULT_BIND_ADDR, DEFAULT_TIMEOUT_MS};
use consensus_signer::watermark::{FileWatermarkStore, InMemoryWatermarkStore, WatermarkStore};
use consensus_signer::{HttpMethod, HttpRequest, SignerRouter, SigningEngine};

/// Remote secp256k1 consensus signer with high watermark protection.
#[derive(Parser, Debug)]
#[command(name = "consensus_signer")]
#[command(about = "Remote consensus signer with double-sign protection")]
#[command(version)]
struct Args {
    /// Secret path segment every route is nested under
    #[arg(long, env = "SECRET_URL_PATH", hide_env_values = true)]
    secret_path: String,

    /// Baker key allowed to request signatures (sppk...)
    #[arg(long, env = "BAKER_AUTHORIZED_KEY")]
    authorized_key: String,

    /// Consensus secret key, hex encoded
    #[arg(long, env = "SIGNER_SECRET_KEY", hide_env_values = true)]
    signing_key: String,

    /// Watermark state file; watermarks are kept in memory when omitted
    #[arg(long, env = "WATERMARK_FILE")]
    watermark_file: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "SIGNER_BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    bind_addr: String,

    /// Timeout for signing and watermark store calls, in milliseconds
    #[arg(long, env = "SIGNER_TIMEOUT_MS", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,
}

impl Args {
    fn into_config(self) -> SignerConfig {
        let timeout = Duration::from_millis(self.timeout_ms);
        SignerConfig {
            secret_path: self.secret_path,
            authorized_key: self.authorized_key,
            signing_key: self.signing_key,
            watermark_file: self.watermark_file,
            bind_addr: self.bind_addr,
            timeouts: Timeouts {
                oracle: timeout,
                store: timeout,
            },
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();

    if let Err(e) = run(config).await {
        error!("Signer failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: SignerConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Starting consensus signer: {:?}", config);

    let authorized_key = AuthorizedKey::from_encoded(&config.authorized_key)?;
    let backend = Arc::new(LocalKeyBackend::from_hex(&config.signing_key)?);
    let store: Arc<dyn WatermarkStore> = match &config.watermark_file {
        Some(path) => Arc::new(FileWatermarkStore::open(path)?),
        None => {
            warn!("No watermark file configured, watermarks will not survive a restart");
            Arc::new(InMemoryWatermarkStore::new())
        }
    };

    let engine = SigningEngine::new(
        backend,
        store,
        RequestAuthenticator::new(authorized_key),
        config.timeouts,
    )
    .await?;
    let router = Arc::new(SignerRouter::new(config.secret_path.clone(), Arc::new(engine)));

    let app = Router::new().fallback(handle).with_state(router);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle(
    State(router): State<Arc<SignerRouter>>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let request = HttpRequest {
        method: HttpMethod::parse(method.as_str()),
        path: uri.path().to_string(),
        query,
        body: if body.is_empty() { None } else { Some(body) },
    };

    let response = router.handle(&request).await;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, response.content_type())],
        response.body,
    )
        .into_response()
}
