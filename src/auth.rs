// src/auth.rs
use crate::db::Store;
use crate::error::AppError;
use crate::models::User;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp::{Filter, Rejection};

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub exp: usize,
}

/// The caller behind a verified bearer token. Handed explicitly to every
/// authenticated handler.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

// Function to create a JWT token
pub fn create_token(user: &User, secret: &str, ttl_hours: i64) -> Result<String, AppError> {
    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        exp: (Utc::now() + Duration::hours(ttl_hours)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        AppError::Unauthorized("Invalid token".to_string())
    })
}

fn bearer_token(header: Option<&str>) -> Result<&str, AppError> {
    let header = header.ok_or_else(|| AppError::Unauthorized("Invalid token".to_string()))?;
    match header.split_once(' ') {
        Some((scheme, token)) if scheme == "Bearer" && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(AppError::Unauthorized("Invalid token".to_string())),
    }
}

pub async fn authenticate(
    header: Option<&str>,
    secret: &str,
    store: &dyn Store,
) -> Result<AuthUser, AppError> {
    let claims = verify_token(bearer_token(header)?, secret)?;
    match store.find_user_by_id(&claims.sub).await? {
        Some(user) => Ok(AuthUser {
            id: user.id,
            email: user.email,
        }),
        None => Err(AppError::Unauthorized("Invalid token".to_string())),
    }
}

pub fn with_auth(
    store: Arc<dyn Store>,
    secret: Arc<String>,
) -> impl Filter<Extract = (AuthUser,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let store = store.clone();
        let secret = secret.clone();
        async move {
            authenticate(header.as_deref(), &secret, store.as_ref())
                .await
                .map_err(warp::reject::custom)
        }
    })
}

pub async fn hash_password(password: String) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, HASH_COST))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::from)
}

pub async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::from)
}
