use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Claims the hub actually consumes. Everything else in the token is ignored.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub exp: u64,
}

#[derive(Debug, Deserialize)]
struct JwksDoc {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    kty: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

/// Token validation: RS256 against a JWKS endpoint, with an HS256 shared
/// secret as the local-dev fallback. JWKS keys are cached after first fetch.
pub struct AuthVerifier {
    jwks_url: Option<String>,
    hs256_secret: Option<String>,
    http: reqwest::Client,
    jwks_cache: tokio::sync::RwLock<HashMap<String, Arc<DecodingKey>>>,
}

impl AuthVerifier {
    pub fn new(jwks_url: Option<String>, hs256_secret: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("market-hub")
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            jwks_url,
            hs256_secret,
            http,
            jwks_cache: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    pub async fn validate(&self, token: &str) -> Result<AuthedUser, ApiError> {
        let header = decode_header(token)
            .map_err(|e| ApiError::Unauthorized(format!("malformed token: {e}")))?;

        let data = match header.alg {
            Algorithm::RS256 => {
                let Some(_) = self.jwks_url.as_deref() else {
                    return Err(ApiError::Unauthorized("RS256 token but no JWKS configured".into()));
                };
                let kid = header
                    .kid
                    .ok_or_else(|| ApiError::Unauthorized("token has no key id".into()))?;
                let key = self.rsa_key(&kid).await?;
                let mut validation = Validation::new(Algorithm::RS256);
                validation.validate_aud = false;
                decode::<Claims>(token, &key, &validation)
            }
            Algorithm::HS256 => {
                let Some(secret) = self.hs256_secret.as_deref() else {
                    return Err(ApiError::Unauthorized("HS256 token but no shared secret configured".into()));
                };
                let key = DecodingKey::from_secret(secret.as_bytes());
                let mut validation = Validation::new(Algorithm::HS256);
                validation.validate_aud = false;
                decode::<Claims>(token, &key, &validation)
            }
            other => {
                return Err(ApiError::Unauthorized(format!(
                    "unsupported token algorithm: {other:?}"
                )));
            }
        }
        .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))?;

        Ok(AuthedUser {
            user_id: data.claims.sub,
            exp: data.claims.exp,
        })
    }

    async fn rsa_key(&self, kid: &str) -> Result<Arc<DecodingKey>, ApiError> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(key) = cache.get(kid) {
                return Ok(key.clone());
            }
        }

        let url = self
            .jwks_url
            .as_deref()
            .ok_or_else(|| ApiError::Unauthorized("no JWKS configured".into()))?;
        let doc: JwksDoc = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| ApiError::Upstream(format!("JWKS parse failed: {e}")))?;

        let mut cache = self.jwks_cache.write().await;
        for jwk in doc.keys {
            if jwk.kty != "RSA" || jwk.n.is_empty() || jwk.e.is_empty() {
                continue;
            }
            if let Ok(key) = DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                cache.insert(jwk.kid.clone(), Arc::new(key));
            }
        }

        cache
            .get(kid)
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized(format!("unknown signing key: {kid}")))
    }
}

/// Pull a bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

impl FromRequestParts<Arc<AppState>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        state.auth.validate(&token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: u64,
    }

    fn hs256_token(secret: &str, sub: &str, exp: u64) -> String {
        encode(
            &Header::default(),
            &TestClaims { sub: sub.into(), exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> u64 {
        (chrono::Utc::now().timestamp() + 3_600) as u64
    }

    #[tokio::test]
    async fn hs256_round_trip() {
        let verifier = AuthVerifier::new(None, Some("dev-secret".into())).unwrap();
        let token = hs256_token("dev-secret", "user-123", future_exp());

        let user = verifier.validate(&token).await.unwrap();
        assert_eq!(user.user_id, "user-123");
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let verifier = AuthVerifier::new(None, Some("dev-secret".into())).unwrap();
        let token = hs256_token("other-secret", "user-123", future_exp());
        assert!(matches!(
            verifier.validate(&token).await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let verifier = AuthVerifier::new(None, Some("dev-secret".into())).unwrap();
        let expired = (chrono::Utc::now().timestamp() - 3_600) as u64;
        let token = hs256_token("dev-secret", "user-123", expired);
        assert!(matches!(
            verifier.validate(&token).await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn hs256_without_configured_secret_is_rejected() {
        let verifier =
            AuthVerifier::new(Some("https://example.test/jwks".into()), None).unwrap();
        let token = hs256_token("dev-secret", "user-123", future_exp());
        assert!(matches!(
            verifier.validate(&token).await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let verifier = AuthVerifier::new(None, Some("dev-secret".into())).unwrap();
        assert!(matches!(
            verifier.validate("not-a-jwt").await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));

        headers.insert("authorization", "Basic xyz".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
