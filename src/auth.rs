//! API-key trust boundary.
//!
//! The wider authentication subsystem (sessions, JWTs, key management) lives
//! outside this service; what matters here is that every merchant-facing
//! handler runs with a merchant identity resolved from a presented secret
//! key. Keys are never stored; only their SHA-256 digest is compared.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{ApiError, ErrorCode};
use crate::handlers::AppState;
use crate::types::Environment;

/// The authenticated principal: a merchant plus the environment its key
/// lives in. Everything the request touches is scoped by these.
#[derive(Debug, Clone)]
pub struct AuthedMerchant {
    pub merchant_id: i64,
    pub environment: Environment,
    pub merchant_name: String,
}

/// Digest an API key the way the store keeps it.
pub fn api_key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

impl FromRequestParts<Arc<AppState>> for AuthedMerchant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| ApiError::new(ErrorCode::AuthRequired, "Missing Authorization header"))?
            .to_str()
            .map_err(|_| ApiError::new(ErrorCode::TokenInvalid, "Malformed Authorization header"))?;
        let key = header.strip_prefix("Bearer ").ok_or_else(|| {
            ApiError::new(ErrorCode::AuthRequired, "Expected a bearer API key")
        })?;
        if !key.starts_with("sk_") {
            return Err(ApiError::new(
                ErrorCode::ApiKeyInvalid,
                "Secret API keys start with sk_",
            ));
        }

        let merchant = state
            .store
            .merchant_by_key_digest(&api_key_digest(key))
            .await?
            .ok_or_else(|| ApiError::new(ErrorCode::ApiKeyInvalid, "Unknown API key"))?;

        Ok(AuthedMerchant {
            merchant_id: merchant.id,
            environment: merchant.environment,
            merchant_name: merchant.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex_sha256() {
        let digest = api_key_digest("sk_test_abc");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, api_key_digest("sk_test_abc"));
        assert_ne!(digest, api_key_digest("sk_test_abd"));
    }
}
