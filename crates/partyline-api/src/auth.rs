//! Authentication module

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use partyline_common::config::{AuthConfig, Config};
use partyline_core::{
    AnalyticsAggregator, BatchDispatcher, CountdownTrigger, Deliverer, EventIngestor, SendQueue,
};
use partyline_storage::Store;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the webhook body signature
pub const SIGNATURE_HEADER: &str = "x-partyline-signature";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub trigger: Arc<CountdownTrigger>,
    pub dispatcher: Arc<BatchDispatcher>,
    pub queue: Arc<SendQueue>,
    pub ingestor: Arc<EventIngestor>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub auth: AuthConfig,
}

impl AppState {
    /// Wire every service over one store and one deliverer
    pub fn build(store: Store, deliverer: Arc<Deliverer>, config: &Config) -> Self {
        let dispatcher = Arc::new(BatchDispatcher::new(
            store.clone(),
            deliverer.clone(),
            &config.dispatch,
        ));
        Self {
            trigger: Arc::new(CountdownTrigger::new(
                store.clone(),
                dispatcher.clone(),
                &config.trigger,
            )),
            queue: Arc::new(SendQueue::new(
                store.clone(),
                deliverer,
                config.queue.clone(),
            )),
            ingestor: Arc::new(EventIngestor::new(store.clone())),
            analytics: Arc::new(AnalyticsAggregator::new(store.clone())),
            dispatcher,
            auth: config.auth.clone(),
            store,
        }
    }
}

/// Extract a bearer token from the request headers
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    if let Some(auth) = headers.get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }
    }

    // X-API-Key header
    headers.get("x-api-key").and_then(|key| key.to_str().ok())
}

/// Hash a key for comparison
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a key against a stored hash.
///
/// Supports Argon2 hashes (`$argon2...`) and legacy SHA-256 hex hashes.
pub fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    if stored_hash.starts_with("$argon2") {
        return PasswordHash::new(stored_hash)
            .ok()
            .and_then(|parsed_hash| {
                Argon2::default()
                    .verify_password(api_key.as_bytes(), &parsed_hash)
                    .ok()
            })
            .is_some();
    }

    hash_api_key(api_key).eq_ignore_ascii_case(stored_hash)
}

/// Admin middleware; admin routes stay closed until a key hash is configured
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    let Some(stored_hash) = state.auth.admin_key_hash.as_deref() else {
        warn!("Admin request to {} rejected: no admin key configured", path);
        return Err(ApiError::unauthorized("Admin access is not configured"));
    };

    let api_key = extract_bearer(request.headers()).ok_or_else(|| {
        warn!("Missing admin key in request to {}", path);
        ApiError::unauthorized("Missing admin key")
    })?;

    if !verify_api_key(api_key, stored_hash) {
        warn!("Invalid admin key for {}", path);
        return Err(ApiError::unauthorized("Invalid admin key"));
    }

    debug!("Admin request authenticated for {}", path);
    Ok(next.run(request).await)
}

/// Scheduler middleware; open when no scheduler secret is configured
pub async fn scheduler_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(stored_hash) = state.auth.scheduler_secret_hash.as_deref() {
        let valid = extract_bearer(request.headers())
            .map(|secret| verify_api_key(secret, stored_hash))
            .unwrap_or(false);
        if !valid {
            warn!("Rejected trigger poll with missing or invalid scheduler secret");
            return Err(ApiError::unauthorized("Invalid scheduler secret"));
        }
    }

    Ok(next.run(request).await)
}

/// Check a webhook delivery against the shared secret.
///
/// Accepts an HMAC-SHA256 hex signature of the raw body, optionally prefixed
/// with `sha256=`, or a `token` query parameter equal to the secret.
pub fn verify_webhook(secret: &str, headers: &HeaderMap, token: Option<&str>, body: &[u8]) -> bool {
    if let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        let signature = signature.trim();
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        return mac.verify_slice(&expected).is_ok();
    }

    match token {
        Some(token) => hash_api_key(token) == hash_api_key(secret),
        None => false,
    }
}

/// Hex HMAC-SHA256 of `body`, as a provider would send it
pub fn sign_webhook(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}
