#![forbid(unsafe_code)]

use crate::auth::types::{AuthError, Claims, Role};
use jsonwebtoken::{
    decode, encode, get_current_timestamp, DecodingKey, EncodingKey, Header, Validation,
};

const TOKEN_LIFETIME_SECS: u64 = 60 * 60;

/// Mint a signed token carrying the relay's claims. The relay itself only
/// verifies tokens at runtime; issuance belongs to the account service, so
/// this is used by ops tooling and tests.
pub fn create_token(
    user_id: &str,
    display_name: &str,
    role: Role,
    meeting_id: Option<&str>,
    secret: &str,
) -> Result<String, AuthError> {
    let claims = Claims {
        sub: user_id.to_string(),
        name: display_name.to_string(),
        role,
        meeting_id: meeting_id.map(str::to_string),
        exp: (get_current_timestamp() + TOKEN_LIFETIME_SECS) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::DatabaseError(format!("JWT encode error: {e}")))
}

/// Verify signature and expiry, returning the claims.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_claims() {
        let secret = "test-secret-at-least-32-bytes-long!!";
        let token =
            create_token("user-123", "Alice", Role::Admin, Some("SC-F00DCAFE"), secret).unwrap();
        let claims = validate_token(&token, secret).unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.name, "Alice");
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.meeting_id.as_deref(), Some("SC-F00DCAFE"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = create_token("user-123", "Alice", Role::User, None, "secret-1").unwrap();
        let result = validate_token(&token, "secret-2");
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_malformed_token_rejected() {
        let result = validate_token("not.a.jwt", "secret");
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_expired_token_detected() {
        let secret = "expiry-test-secret";
        // exp far in the past, beyond the default leeway
        let claims = Claims {
            sub: "user-123".to_string(),
            name: "Alice".to_string(),
            role: Role::User,
            meeting_id: None,
            exp: 1_000_000,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        let result = validate_token(&token, secret);
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }
}
