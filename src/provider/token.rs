//! OAuth2 client-credentials token cache.
//!
//! MonCash and NatCash both gate their REST APIs behind short-lived
//! client-credentials tokens. Tokens are cached per channel with a TTL of
//! the provider-reported lifetime minus a 60-second safety margin, so a
//! worker burst mints at most one token per lifetime. Concurrent misses may
//! each fetch; tokens are interchangeable so the last writer wins.

use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::cache::TtlCache;
use crate::provider::ProviderError;
use crate::types::Channel;

/// Timeout for token endpoint calls, tighter than ordinary provider calls.
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Margin subtracted from the provider-reported token lifetime.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// A provider's token endpoint plus the credentials to present to it.
#[derive(Debug, Clone)]
pub struct OauthEndpoint {
    pub token_url: Url,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Per-channel cache of live bearer tokens.
pub struct TokenCache {
    http: reqwest::Client,
    tokens: TtlCache<Channel, String>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            tokens: TtlCache::new(),
        }
    }

    /// Return a live bearer token for `channel`, minting one if needed.
    #[tracing::instrument(skip_all, fields(%channel))]
    pub async fn bearer_token(
        &self,
        channel: Channel,
        endpoint: &OauthEndpoint,
    ) -> Result<String, ProviderError> {
        if let Some(token) = self.tokens.get(&channel) {
            return Ok(token);
        }

        let response = self
            .http
            .post(endpoint.token_url.clone())
            .basic_auth(&endpoint.client_id, Some(&endpoint.client_secret))
            .form(&[("grant_type", "client_credentials"), ("scope", "read,write")])
            .timeout(TOKEN_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(channel, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Remote {
                channel,
                status: Some(status.as_u16()),
                message: format!("token endpoint: {}", crate::provider::snippet(&body)),
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Malformed {
                    channel,
                    message: format!("token response: {e}"),
                })?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(0));
        if let Some(ttl) = lifetime.checked_sub(EXPIRY_MARGIN)
            && !ttl.is_zero()
        {
            self.tokens.insert(channel, token.access_token.clone(), ttl);
            tracing::debug!(ttl_secs = ttl.as_secs(), "token cached");
        }
        Ok(token.access_token)
    }

    /// Drop the cached token for `channel`, forcing a refresh on next use.
    pub fn invalidate(&self, channel: Channel) {
        self.tokens.remove(&channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(server: &MockServer) -> OauthEndpoint {
        OauthEndpoint {
            token_url: format!("{}/Api/oauth/token", server.uri()).parse().unwrap(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn token_is_fetched_once_within_its_lifetime() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Api/oauth/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok-1",
                "token_type": "bearer",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = TokenCache::new(reqwest::Client::new());
        let endpoint = endpoint(&server);
        let first = cache
            .bearer_token(Channel::Moncash, &endpoint)
            .await
            .expect("first fetch");
        let second = cache
            .bearer_token(Channel::Moncash, &endpoint)
            .await
            .expect("cache hit");
        assert_eq!(first, "tok-1");
        assert_eq!(second, "tok-1");
    }

    #[tokio::test]
    async fn short_lived_tokens_are_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Api/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok",
                "expires_in": 30,
            })))
            .expect(2)
            .mount(&server)
            .await;

        let cache = TokenCache::new(reqwest::Client::new());
        let endpoint = endpoint(&server);
        cache
            .bearer_token(Channel::Natcash, &endpoint)
            .await
            .expect("fetch");
        cache
            .bearer_token(Channel::Natcash, &endpoint)
            .await
            .expect("refetch");
    }

    #[tokio::test]
    async fn token_endpoint_failure_is_a_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Api/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .mount(&server)
            .await;

        let cache = TokenCache::new(reqwest::Client::new());
        let error = cache
            .bearer_token(Channel::Moncash, &endpoint(&server))
            .await
            .expect_err("401 must fail");
        assert!(matches!(
            error,
            ProviderError::Remote {
                status: Some(401),
                ..
            }
        ));
    }
}
