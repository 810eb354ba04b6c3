use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 300;

#[derive(Debug, Error)]
pub enum ServiceAuthError {
    #[error("service token secret is empty")]
    EmptySecret,
    #[error("failed to sign service token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone)]
pub struct ServiceTokenConfig {
    pub issuer: String,
    pub secret: String,
    pub ttl_seconds: i64,
}

impl ServiceTokenConfig {
    pub fn new(issuer: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            secret: secret.into(),
            ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    aud: String,
    exp: i64,
    iat: i64,
    jti: String,
}

/// Signs the bearer token presented to one CDS service. The audience is the
/// service URL itself.
pub fn mint_service_token(
    cfg: &ServiceTokenConfig,
    service_url: &str,
) -> Result<String, ServiceAuthError> {
    if cfg.secret.is_empty() {
        return Err(ServiceAuthError::EmptySecret);
    }
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        iss: cfg.issuer.clone(),
        aud: service_url.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
        jti: Uuid::new_v4().to_string(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )?;
    Ok(token)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
