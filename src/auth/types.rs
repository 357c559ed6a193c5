#![forbid(unsafe_code)]

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};

/// User role carried in token claims.
///
/// Closed set: admin checks are a match on this enum, never a string
/// comparison against the raw claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    /// Whether this role may mute, remove, or silently monitor participants.
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Parse a stored role string, treating anything unknown as a plain user.
    pub fn from_db(value: &str) -> Self {
        match value {
            "admin" => Role::Admin,
            "super_admin" => Role::SuperAdmin,
            _ => Role::User,
        }
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    TokenExpired,
    UserNotFound,
    AccountDisabled,
    Forbidden,
    NotConfigured,
    DatabaseError(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            AuthError::MissingToken => "Missing authorization",
            AuthError::InvalidToken => "Invalid token",
            AuthError::TokenExpired => "Token expired",
            AuthError::UserNotFound => "User not found",
            AuthError::AccountDisabled => "Account disabled",
            AuthError::Forbidden => "Unauthorized",
            AuthError::NotConfigured => "Authentication not configured",
            AuthError::DatabaseError(_) => "Database error",
        };
        f.write_str(message)
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingToken
            | AuthError::InvalidToken
            | AuthError::TokenExpired
            | AuthError::UserNotFound => StatusCode::UNAUTHORIZED,
            AuthError::AccountDisabled | AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Token claims. `meeting_id` is the user's personal meeting identity,
/// used when a join request does not name one.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(rename = "meetingId", default, skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<String>,
    pub exp: usize,
}

/// Authenticated identity attached to a connection for its whole lifetime.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub meeting_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_gate() {
        assert!(Role::Admin.is_admin());
        assert!(Role::SuperAdmin.is_admin());
        assert!(!Role::User.is_admin());
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::SuperAdmin).unwrap(), "\"super_admin\"");
        assert_eq!(serde_json::from_str::<Role>("\"admin\"").unwrap(), Role::Admin);
    }

    #[test]
    fn test_unknown_db_role_demoted() {
        assert_eq!(Role::from_db("moderator"), Role::User);
        assert_eq!(Role::from_db("super_admin"), Role::SuperAdmin);
    }

    #[test]
    fn test_claims_without_role_default_to_user() {
        let claims: Claims = serde_json::from_str(
            r#"{"sub":"u1","name":"Alice","exp":4102444800}"#,
        )
        .unwrap();
        assert_eq!(claims.role, Role::User);
        assert!(claims.meeting_id.is_none());
    }
}
