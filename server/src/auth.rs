//! Bearer-token authentication.
//!
//! Token verification is an external collaborator concern; this module only
//! validates the JWT signature/expiry and extracts the account identity plus
//! the device/session headers the pipeline and hub key on.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: String,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

enum VerifierInner {
    Rs256(DecodingKey),
    Hs256(DecodingKey),
    /// No key configured: claims are decoded without signature validation.
    /// Development only; `from_config` logs loudly when this is active.
    Insecure,
}

#[derive(Clone)]
pub struct TokenVerifier {
    inner: Arc<VerifierInner>,
}

impl TokenVerifier {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let inner = if let Some(pem) = &config.jwt_public_key {
            VerifierInner::Rs256(DecodingKey::from_rsa_pem(pem.as_bytes())?)
        } else if let Some(secret) = &config.jwt_secret {
            VerifierInner::Hs256(DecodingKey::from_secret(secret.as_bytes()))
        } else {
            tracing::warn!(
                "no JWT_PUBLIC_KEY or JWT_SECRET configured; tokens are NOT signature-checked"
            );
            VerifierInner::Insecure
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    #[cfg(test)]
    pub fn insecure_for_tests() -> Self {
        Self {
            inner: Arc::new(VerifierInner::Insecure),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let result = match &*self.inner {
            VerifierInner::Rs256(key) => {
                jsonwebtoken::decode::<Claims>(token, key, &Validation::new(Algorithm::RS256))
            }
            VerifierInner::Hs256(key) => {
                jsonwebtoken::decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
            }
            VerifierInner::Insecure => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.insecure_disable_signature_validation();
                jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(b""), &validation)
            }
        };
        result.map(|data| data.claims).map_err(|e| {
            tracing::debug!(
                token = %crate::redact::token(token),
                error = %e,
                "token verification failed"
            );
            ApiError::Auth("invalid bearer token".to_string())
        })
    }
}

/// Authenticated caller identity. Device and session ids come from headers
/// and are only required by the operations that key on them.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub account_id: Uuid,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
}

impl AuthContext {
    pub fn require_device(&self) -> Result<&str, ApiError> {
        self.device_id
            .as_deref()
            .ok_or_else(|| ApiError::Validation(format!("missing {DEVICE_ID_HEADER} header")))
    }

    pub fn require_session(&self) -> Result<&str, ApiError> {
        self.session_id
            .as_deref()
            .ok_or_else(|| ApiError::Validation(format!("missing {SESSION_ID_HEADER} header")))
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
    TokenVerifier: axum::extract::FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = TokenVerifier::from_ref(state);

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| ApiError::Auth("missing bearer token".to_string()))?;

        let claims = verifier.verify(token)?;
        let account_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ApiError::Auth("token subject is not an account id".to_string()))?;

        let header_value = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Ok(AuthContext {
            account_id,
            device_id: header_value(DEVICE_ID_HEADER),
            session_id: header_value(SESSION_ID_HEADER),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(sub: &str, secret: &[u8]) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
            iat: None,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn insecure_mode_decodes_claims() {
        let verifier = TokenVerifier::insecure_for_tests();
        let account = Uuid::new_v4().to_string();
        let token = make_token(&account, b"whatever");
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, account);
    }

    #[test]
    fn hs256_rejects_wrong_secret() {
        let config = Config {
            base_url: "http://localhost".into(),
            port: 0,
            storage_driver: crate::config::StorageDriver::Memory,
            database_url: None,
            redis_url: None,
            rate_limit_disabled: true,
            jwt_public_key: None,
            jwt_secret: Some("right-secret".into()),
        };
        let verifier = TokenVerifier::from_config(&config).unwrap();

        let good = make_token(&Uuid::new_v4().to_string(), b"right-secret");
        assert!(verifier.verify(&good).is_ok());

        let bad = make_token(&Uuid::new_v4().to_string(), b"wrong-secret");
        assert!(verifier.verify(&bad).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let verifier = TokenVerifier::insecure_for_tests();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            exp: chrono::Utc::now().timestamp() - 120,
            iat: None,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b""),
        )
        .unwrap();
        assert!(verifier.verify(&token).is_err());
    }
}
