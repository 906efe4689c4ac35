//! Wire types and shared-storage keys for Keystone session clients.
//!
//! This crate is shared by the session library and its hosts to prevent schema
//! drift. The backend remains the authority on credentials, but clients validate
//! auth payloads here before they ever reach the token store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LOGIN_PATH: &str = "/auth/v3/login/";
pub const REFRESH_PATH: &str = "/auth/v3/refresh_token";
pub const LOGOUT_PATH: &str = "/auth/v3/logout/";
pub const REFRESH_QUERY_PARAM: &str = "refresh_token";

/// Value stored under [`StorageKey::TokenRefreshInProgress`] while a refresh runs.
pub const REFRESH_IN_PROGRESS_VALUE: &str = "true";

/// Returns true when `path` targets the refresh endpoint, with or without a
/// query string or trailing slash.
pub fn is_refresh_path(path: &str) -> bool {
    let bare = path.split('?').next().unwrap_or(path);
    bare.trim_end_matches('/') == REFRESH_PATH
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persisted keys
// ═══════════════════════════════════════════════════════════════════════════════

/// Names of the entries kept in durable storage shared by every tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    AccessToken,
    RefreshToken,
    UserId,
    LastActivity,
    TokenRefreshInProgress,
}

impl StorageKey {
    pub const ALL: [StorageKey; 5] = [
        StorageKey::AccessToken,
        StorageKey::RefreshToken,
        StorageKey::UserId,
        StorageKey::LastActivity,
        StorageKey::TokenRefreshInProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::AccessToken => "accessToken",
            StorageKey::RefreshToken => "refreshToken",
            StorageKey::UserId => "userId",
            StorageKey::LastActivity => "lastActivity",
            StorageKey::TokenRefreshInProgress => "tokenRefreshInProgress",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Auth payloads
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub domain_name: String,
}

/// Body returned by a successful login (and registration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body returned by the refresh endpoint. Some deployments do not rotate the
/// refresh token, in which case the field is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl AuthResponse {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_token(&self.access_token, "access_token")?;
        require_token(&self.refresh_token, "refresh_token")?;
        if self.user_id.trim().is_empty() {
            return Err(ErrorInfo::new("missing_field", "user_id is required"));
        }
        Ok(())
    }
}

impl RefreshResponse {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_token(&self.access_token, "access_token")?;
        if let Some(refresh) = &self.refresh_token {
            require_token(refresh, "refresh_token")?;
        }
        Ok(())
    }
}

pub fn parse_auth_response(body: Value) -> Result<AuthResponse, ErrorInfo> {
    let response: AuthResponse = serde_json::from_value(body).map_err(|err| {
        ErrorInfo::new(
            "invalid_auth_response",
            format!("login payload is malformed: {}", err),
        )
    })?;
    response.validate()?;
    Ok(response)
}

pub fn parse_refresh_response(body: Value) -> Result<RefreshResponse, ErrorInfo> {
    let response: RefreshResponse = serde_json::from_value(body).map_err(|err| {
        ErrorInfo::new(
            "invalid_refresh_response",
            format!("refresh payload is malformed: {}", err),
        )
    })?;
    response.validate()?;
    Ok(response)
}

fn require_token(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ErrorInfo::new(
            "invalid_token",
            format!("{} must not contain whitespace", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn refresh_path_matches_with_query() {
        assert!(is_refresh_path("/auth/v3/refresh_token?refresh_token=abc"));
        assert!(is_refresh_path("/auth/v3/refresh_token/"));
        assert!(!is_refresh_path("/auth/v3/login/"));
        assert!(!is_refresh_path("/management/v1/users"));
    }

    #[test]
    fn storage_keys_round_trip_names() {
        for key in StorageKey::ALL {
            assert_eq!(StorageKey::from_str(key.as_str()), Some(key));
        }
        assert_eq!(StorageKey::from_str("appState"), None);
    }

    #[test]
    fn parses_login_response() {
        let response = parse_auth_response(json!({
            "access_token": "a.b.c",
            "refresh_token": "r-1",
            "user_id": "42",
            "token_type": "bearer",
            "message": "Login successful"
        }))
        .expect("valid login response");
        assert_eq!(response.user_id, "42");
        assert_eq!(response.message.as_deref(), Some("Login successful"));
    }

    #[test]
    fn login_response_defaults_token_type() {
        let response = parse_auth_response(json!({
            "access_token": "a.b.c",
            "refresh_token": "r-1",
            "user_id": "42"
        }))
        .expect("valid login response");
        assert_eq!(response.token_type, "bearer");
    }

    #[test]
    fn rejects_login_response_without_refresh_token() {
        let err = parse_auth_response(json!({
            "access_token": "a.b.c",
            "user_id": "42"
        }))
        .unwrap_err();
        assert_eq!(err.code, "invalid_auth_response");
    }

    #[test]
    fn refresh_response_without_rotation() {
        let response = parse_refresh_response(json!({ "access_token": "new" }))
            .expect("valid refresh response");
        assert_eq!(response.refresh_token, None);
    }

    #[test]
    fn rejects_empty_refresh_access_token() {
        let err = parse_refresh_response(json!({ "access_token": "  " })).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }
}
