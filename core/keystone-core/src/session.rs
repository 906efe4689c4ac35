//! Session state and the token store that owns it.
//!
//! ## State Machine
//!
//! ```text
//! SetCredentials     → tokens + user set, authenticated, activity = now
//! UpdateTokens       → both tokens replaced, authenticated unchanged
//! UpdateAccessToken  → access token replaced, activity = now
//! Logout             → everything cleared
//! ```
//!
//! [`reduce_session`] is pure. [`TokenStore`] applies it, mirrors local
//! transitions into shared storage, and publishes every snapshot on a watch
//! channel so timers and UI can react to authentication changes.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use keystone_protocol::{AuthResponse, StorageKey};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::storage::SharedStorage;
use crate::token::{self, TokenValidity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionUser {
    pub id: String,
    pub tenant_id: Option<String>,
    pub role_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub is_authenticated: bool,
    pub user: Option<SessionUser>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Session {
    pub fn access_token_expires_at(&self) -> Result<DateTime<Utc>> {
        let access = self
            .access_token
            .as_deref()
            .ok_or(SessionError::NotAuthenticated)?;
        Ok(token::expires_at(access)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    SetCredentials(AuthResponse),
    UpdateTokens { access: String, refresh: String },
    UpdateAccessToken(String),
    Logout,
}

impl SessionAction {
    fn name(&self) -> &'static str {
        match self {
            SessionAction::SetCredentials(_) => "set_credentials",
            SessionAction::UpdateTokens { .. } => "update_tokens",
            SessionAction::UpdateAccessToken(_) => "update_access_token",
            SessionAction::Logout => "logout",
        }
    }

    /// Storage entries the transition rewrites. Entries outside this set may
    /// hold newer values from other tabs and are left alone.
    fn persisted_keys(&self) -> &'static [StorageKey] {
        match self {
            SessionAction::SetCredentials(_) | SessionAction::Logout => &SESSION_KEYS,
            SessionAction::UpdateTokens { .. } => {
                &[StorageKey::RefreshToken, StorageKey::AccessToken]
            }
            SessionAction::UpdateAccessToken(_) => {
                &[StorageKey::LastActivity, StorageKey::AccessToken]
            }
        }
    }
}

pub fn reduce_session(current: &Session, action: &SessionAction, now: DateTime<Utc>) -> Session {
    match action {
        SessionAction::SetCredentials(response) => Session {
            access_token: Some(response.access_token.clone()),
            refresh_token: Some(response.refresh_token.clone()),
            is_authenticated: true,
            user: Some(user_from_token(&response.user_id, &response.access_token)),
            last_activity: Some(now),
        },
        SessionAction::UpdateTokens { access, refresh } => Session {
            access_token: Some(access.clone()),
            refresh_token: Some(refresh.clone()),
            ..current.clone()
        },
        SessionAction::UpdateAccessToken(access) => Session {
            access_token: Some(access.clone()),
            last_activity: Some(now),
            ..current.clone()
        },
        SessionAction::Logout => Session::default(),
    }
}

/// User identity: the id comes from the auth response, tenant and role from
/// the access-token claims when the backend includes them.
fn user_from_token(user_id: &str, access_token: &str) -> SessionUser {
    let claims = token::decode_claims(access_token).ok();
    SessionUser {
        id: user_id.to_string(),
        tenant_id: claims.as_ref().and_then(|c| c.tenant_id.clone()),
        role_id: claims.as_ref().and_then(|c| c.role_id.clone()),
    }
}

fn user_id_from_claims(access_token: &str) -> Option<String> {
    let claims = token::decode_claims(access_token).ok()?;
    claims.user_id.or(claims.sub)
}

pub fn millis_to_datetime(value: &str) -> Option<DateTime<Utc>> {
    let millis = value.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token store
// ═══════════════════════════════════════════════════════════════════════════════

const SESSION_KEYS: [StorageKey; 4] = [
    StorageKey::RefreshToken,
    StorageKey::UserId,
    StorageKey::LastActivity,
    StorageKey::AccessToken,
];

/// Single source of truth for one tab's session.
pub struct TokenStore {
    storage: Arc<dyn SharedStorage>,
    state: watch::Sender<Session>,
}

impl TokenStore {
    /// Builds the initial session from persisted storage. A missing, expired or
    /// undecodable access token starts the tab unauthenticated and clears the
    /// persisted session.
    pub fn restore(storage: Arc<dyn SharedStorage>, now: DateTime<Utc>) -> Self {
        let session = match storage.get(StorageKey::AccessToken.as_str()) {
            None => Session::default(),
            Some(access) => match token::evaluate(&access, now) {
                TokenValidity::Valid { expires_at } => {
                    debug!(expires_at = %expires_at, "Restored persisted session");
                    restored_session(storage.as_ref(), access)
                }
                validity => {
                    warn!(?validity, "Persisted access token unusable; starting signed out");
                    clear_persisted(storage.as_ref());
                    Session::default()
                }
            },
        };

        let (state, _) = watch::channel(session);
        Self { storage, state }
    }

    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    pub fn storage(&self) -> &Arc<dyn SharedStorage> {
        &self.storage
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.borrow().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.borrow().refresh_token.clone()
    }

    /// The refresh token as other tabs last left it in shared storage.
    pub fn persisted_refresh_token(&self) -> Option<String> {
        self.storage
            .get(StorageKey::RefreshToken.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn set_credentials(&self, response: AuthResponse) {
        self.apply_local(SessionAction::SetCredentials(response), Utc::now());
    }

    pub fn update_tokens(&self, access: String, refresh: String) {
        self.apply_local(SessionAction::UpdateTokens { access, refresh }, Utc::now());
    }

    pub fn update_access_token(&self, access: String) {
        self.apply_local(SessionAction::UpdateAccessToken(access), Utc::now());
    }

    pub fn logout(&self) {
        self.apply_local(SessionAction::Logout, Utc::now());
    }

    /// Applies a transition and mirrors it into shared storage.
    pub fn apply_local(&self, action: SessionAction, now: DateTime<Utc>) {
        let next = self.transition(&action, now);
        persist(self.storage.as_ref(), &next, action.persisted_keys());
        info!(
            action = action.name(),
            authenticated = next.is_authenticated,
            "Session updated"
        );
    }

    /// Applies a transition that another tab already persisted.
    pub fn apply_remote(&self, action: SessionAction, now: DateTime<Utc>) {
        let next = self.transition(&action, now);
        debug!(
            action = action.name(),
            authenticated = next.is_authenticated,
            "Session updated from another tab"
        );
    }

    /// Stamps user activity without waking session subscribers.
    pub fn record_activity(&self, now: DateTime<Utc>) {
        self.state.send_if_modified(|session| {
            session.last_activity = Some(now);
            false
        });
        if let Err(err) = self.storage.set(
            StorageKey::LastActivity.as_str(),
            &now.timestamp_millis().to_string(),
        ) {
            warn!(error = %err, "Failed to persist last activity");
        }
    }

    /// Most recent activity seen by any tab.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let shared = self
            .storage
            .get(StorageKey::LastActivity.as_str())
            .and_then(|value| millis_to_datetime(&value));
        let local = self.state.borrow().last_activity;
        shared.max(local)
    }

    fn transition(&self, action: &SessionAction, now: DateTime<Utc>) -> Session {
        let mut next = Session::default();
        self.state.send_modify(|session| {
            *session = reduce_session(session, action, now);
            next = session.clone();
        });
        next
    }
}

fn restored_session(storage: &dyn SharedStorage, access: String) -> Session {
    let user_id = storage
        .get(StorageKey::UserId.as_str())
        .or_else(|| user_id_from_claims(&access));
    let user = user_id.map(|id| user_from_token(&id, &access));
    Session {
        refresh_token: storage.get(StorageKey::RefreshToken.as_str()),
        last_activity: storage
            .get(StorageKey::LastActivity.as_str())
            .and_then(|value| millis_to_datetime(&value)),
        access_token: Some(access),
        is_authenticated: true,
        user,
    }
}

fn persist(storage: &dyn SharedStorage, session: &Session, keys: &[StorageKey]) {
    for &key in keys {
        let value = match key {
            StorageKey::AccessToken => session.access_token.clone(),
            StorageKey::RefreshToken => session.refresh_token.clone(),
            StorageKey::UserId => session.user.as_ref().map(|user| user.id.clone()),
            StorageKey::LastActivity => session
                .last_activity
                .map(|at| at.timestamp_millis().to_string()),
            StorageKey::TokenRefreshInProgress => None,
        };
        let result = match value {
            Some(value) => storage.set(key.as_str(), &value),
            None => storage.remove(key.as_str()),
        };
        if let Err(err) = result {
            warn!(error = %err, key = key.as_str(), "Failed to persist session entry");
        }
    }
}

fn clear_persisted(storage: &dyn SharedStorage) {
    persist(storage, &Session::default(), &SESSION_KEYS);
}
