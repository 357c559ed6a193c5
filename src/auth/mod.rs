#![forbid(unsafe_code)]

// Auth module - token verification for WebSocket sessions and the HTTP API

pub mod jwt;
pub mod types;

pub use types::{AuthError, AuthUser, Claims, Role};

use sqlx::PgPool;

/// Verify a bearer token and, when a database is configured, require the
/// user row to still be active. A deactivated account fails even with a
/// token that verifies.
pub async fn authenticate(
    token: &str,
    secret: &str,
    db: Option<&PgPool>,
) -> Result<AuthUser, AuthError> {
    let claims = jwt::validate_token(token, secret)?;

    if let Some(pool) = db {
        match crate::store::user_active(pool, &claims.sub).await {
            Ok(Some(true)) => {}
            Ok(Some(false)) => return Err(AuthError::AccountDisabled),
            Ok(None) => return Err(AuthError::UserNotFound),
            Err(e) => return Err(AuthError::DatabaseError(e.to_string())),
        }
    }

    Ok(AuthUser {
        id: claims.sub,
        name: claims.name,
        role: claims.role,
        meeting_id: claims.meeting_id,
    })
}
