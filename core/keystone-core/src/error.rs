//! Error types for keystone-core operations.
//! Keep RefreshFailure cloneable: every waiter on a shared refresh receives a copy.

use std::path::PathBuf;

use crate::token::TokenError;

/// All errors that can occur in keystone-core operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Request to {path} failed: {details}")]
    Transport { path: String, details: String },

    #[error("Request to {path} returned HTTP {status}")]
    Http {
        path: String,
        status: u16,
        body: Option<serde_json::Value>,
    },

    #[error("Response from {path} is malformed: {details}")]
    MalformedResponse { path: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session expired: {0}")]
    SessionExpired(RefreshFailure),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage read failed: {path}: {source}")]
    StorageRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage write failed: {path}: {source}")]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage file corrupt: {path}: {details}")]
    StorageCorrupt { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration write failed: {path}: {source}")]
    ConfigWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid base URL {url}: {details}")]
    InvalidBaseUrl { url: String, details: String },
}

impl SessionError {
    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            SessionError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the error means the session is gone and the user must log in again.
    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            SessionError::SessionExpired(_) | SessionError::NotAuthenticated
        )
    }
}

/// Why a refresh attempt ended the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshFailure {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh endpoint returned HTTP {0}")]
    Rejected(u16),

    #[error("refresh request failed: {0}")]
    Transport(String),

    #[error("refresh response malformed: {0}")]
    Malformed(String),
}

/// Convenience type alias for Results using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

impl From<SessionError> for String {
    fn from(err: SessionError) -> String {
        err.to_string()
    }
}
