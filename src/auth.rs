use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{errors::ServiceError, AppState};

/// Claims carried by caller bearer tokens. Issuance lives outside this
/// subsystem; only validation is consumed here.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub is_admin: bool,
}

/// Authenticated caller, extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub is_admin: bool,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ServiceError::MissingAuth)?;

        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ServiceError::InvalidAuth("expected a bearer token".into()))?;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| ServiceError::InvalidAuth(e.to_string()))?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ServiceError::InvalidAuth("subject is not a user id".into()))?;

        Ok(AuthUser {
            user_id,
            is_admin: data.claims.is_admin,
        })
    }
}

/// Constant-time string comparison for secrets and signatures.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// Checks an inbound API key against the configured active set.
pub fn verify_api_key(candidate: &str, active_keys: &[String]) -> bool {
    active_keys.iter().any(|k| constant_time_eq(k, candidate))
}
