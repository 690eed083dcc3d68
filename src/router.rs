// Request router
//
// Maps HTTP-shaped requests onto the signing engine. Routing is kept free of
// any HTTP server so it can be hosted by the binary or driven directly in
// tests.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::auth::AuthError;
use crate::codec;
use crate::engine::SigningEngine;
use crate::error::{Result, SignerError};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Query parameter carrying the authentication signature
pub const AUTHENTICATION_PARAM: &str = "authentication";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Other,
}

impl HttpMethod {
    pub fn parse(method: &str) -> Self {
        match method {
            "GET" => Self::Get,
            "POST" => Self::Post,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.insert(name.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// JSON response; the content type is always [`CONTENT_TYPE_JSON`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, body },
            Err(_) => Self {
                status: 500,
                body: r#"{"error":"Internal Server Error"}"#.to_string(),
            },
        }
    }

    fn error(error: &SignerError) -> Self {
        Self::json(
            error.status_code(),
            &ErrorResponse {
                error: error.to_string(),
            },
        )
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignatureResponse {
    pub signature: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyResponse {
    pub public_key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKeysResponse {
    pub authorized_keys: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

/// Decode the hex payload of a signing request body, a JSON string such as
/// `"11000000..."`
pub fn parse_sign_body(body: Option<&str>) -> Result<Vec<u8>> {
    let body = body.map(str::trim).unwrap_or_default();
    if body.is_empty() {
        return Err(SignerError::MissingBody);
    }

    let hex = serde_json::from_str::<String>(body)
        .map_err(|e| SignerError::InvalidBody(e.to_string()))?;
    if hex.is_empty() {
        return Err(SignerError::MissingBody);
    }
    Ok(codec::hex_to_bytes(&hex)?)
}

/// Replace the leading path segment, which may be the secret, for logging
fn redact_secret(path: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.split_once('/') {
        Some((_, rest)) => format!("/***/{}", rest),
        None => "/***".to_string(),
    }
}

enum Route<'a> {
    AuthorizedKeys,
    Key(&'a str),
}

pub struct SignerRouter {
    secret_path: String,
    engine: Arc<SigningEngine>,
}

impl SignerRouter {
    pub fn new(secret_path: impl Into<String>, engine: Arc<SigningEngine>) -> Self {
        Self {
            secret_path: secret_path.into(),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<SigningEngine> {
        &self.engine
    }

    fn is_secret(&self, segment: &str) -> bool {
        segment.as_bytes().ct_eq(self.secret_path.as_bytes()).into()
    }

    fn resolve<'a>(&self, path: &'a str) -> Option<Route<'a>> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        let segments: Vec<&str> = path.split('/').collect();

        match segments.as_slice() {
            [secret, "authorized_keys"] if self.is_secret(secret) => Some(Route::AuthorizedKeys),
            [secret, "keys", address] if self.is_secret(secret) && !address.is_empty() => {
                Some(Route::Key(*address))
            }
            _ => None,
        }
    }

    /// Handle one request. Every outcome, including failures, is a JSON
    /// response.
    pub async fn handle(&self, request: &HttpRequest) -> HttpResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    method = ?request.method,
                    path = %redact_secret(&request.path),
                    status = e.status_code(),
                    error_kind = ?e.kind(),
                    "Request failed: {}",
                    e
                );
                HttpResponse::error(&e)
            }
        }
    }

    async fn dispatch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let route = self.resolve(&request.path).ok_or(SignerError::NotFound)?;

        match (route, request.method) {
            (Route::AuthorizedKeys, HttpMethod::Get) => {
                debug!("authorized_keys requested");
                Ok(HttpResponse::json(
                    200,
                    &AuthorizedKeysResponse {
                        authorized_keys: vec![self
                            .engine
                            .authenticator()
                            .authorized_key()
                            .address()
                            .to_string()],
                    },
                ))
            }
            (Route::Key(address), HttpMethod::Get) => {
                let identity = self.engine.identity();
                if address != identity.address() {
                    return Err(SignerError::NotFound);
                }
                Ok(HttpResponse::json(
                    200,
                    &PublicKeyResponse {
                        public_key: identity.encoded_public_key().to_string(),
                    },
                ))
            }
            (Route::Key(address), HttpMethod::Post) => {
                if address != self.engine.identity().address() {
                    return Err(SignerError::NotFound);
                }
                let payload = parse_sign_body(request.body.as_deref())?;
                let authentication = request
                    .query
                    .get(AUTHENTICATION_PARAM)
                    .ok_or(AuthError::Unauthorized("missing authentication token"))?;

                let signed = self.engine.sign(address, &payload, authentication).await?;
                Ok(HttpResponse::json(
                    200,
                    &SignatureResponse {
                        signature: signed.signature,
                    },
                ))
            }
            _ => Err(SignerError::MethodNotAllowed),
        }
    }
}
