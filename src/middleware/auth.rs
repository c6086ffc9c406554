//! JWT validation. RS256 only; the public key is loaded once at startup and
//! immutable afterwards; there is no symmetric fallback.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

static DECODING_KEY: OnceCell<DecodingKey> = OnceCell::new();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id as a UUID string.
    pub sub: String,
    /// Expiration time (unix timestamp).
    pub exp: i64,
}

/// Must be called once during startup, before any token is verified.
pub fn initialize_jwt_validation(public_key_pem: &str) -> Result<(), AppError> {
    let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
        .map_err(|e| AppError::Config(format!("invalid JWT public key: {e}")))?;
    // Repeated initialization with the same key is harmless (tests).
    let _ = DECODING_KEY.set(key);
    Ok(())
}

pub fn verify_jwt(token: &str) -> Result<Claims, AppError> {
    let key = DECODING_KEY
        .get()
        .ok_or_else(|| AppError::Config("JWT validation not initialized".into()))?;
    let validation = Validation::new(Algorithm::RS256);
    match decode::<Claims>(token, key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(_) => Err(AppError::Unauthorized),
    }
}

pub fn user_id_from_token(token: &str) -> Result<Uuid, AppError> {
    let claims = verify_jwt(token)?;
    Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized)
}

/// Middleware: extracts the bearer token and stores the authenticated user id
/// in request extensions. Session identity always comes from here, never from
/// request bodies.
pub async fn auth_middleware(
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, AppError> {
    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AppError::Unauthorized)?;

    let user_id = user_id_from_token(token)?;
    req.extensions_mut().insert(user_id);

    Ok(next.run(req).await)
}

/// The authenticated user, extracted from what `auth_middleware` stored.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for User
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .extensions
            .get::<Uuid>()
            .cloned()
            .ok_or(AppError::Unauthorized)?;
        Ok(User { id: user_id })
    }
}
