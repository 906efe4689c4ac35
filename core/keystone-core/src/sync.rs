//! Keeps a tab's in-memory session in step with writes made by other tabs.
//!
//! ```text
//! other tab writes ──► StorageEvent ──► TabSync
//!                                         ├─ accessToken set     → apply_remote(UpdateTokens)
//!                                         ├─ accessToken removed → apply_remote(Logout) + /login
//!                                         └─ anything else       → logged
//! ```
//!
//! Every session transition writes `accessToken` last, so the pair is read
//! back only on that key's event; a `refreshToken` event alone may sit next
//! to the previous access token. Remote transitions are applied to memory
//! only; the writing tab already persisted them. The storage layer never
//! echoes a tab's own writes back.

use std::sync::Arc;

use chrono::Utc;
use keystone_protocol::StorageKey;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::navigation::Navigator;
use crate::session::{SessionAction, TokenStore};
use crate::storage::StorageEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    TokensUpdated,
    LoggedOut,
    Ignored,
}

pub struct TabSync {
    store: Arc<TokenStore>,
    navigator: Arc<dyn Navigator>,
}

impl TabSync {
    pub fn new(store: Arc<TokenStore>, navigator: Arc<dyn Navigator>) -> Self {
        Self { store, navigator }
    }

    /// Subscribes immediately, so no event written after this call is missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.store.storage().subscribe();
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: broadcast::Receiver<StorageEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.handle_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed storage events; resynchronizing session");
                    self.resync();
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Tab sync stopped");
    }

    pub fn handle_event(&self, event: &StorageEvent) -> SyncOutcome {
        match event.storage_key() {
            Some(StorageKey::AccessToken) if event.new_value.is_none() => {
                if event.is_removal() {
                    self.remote_logout()
                } else {
                    // Removing a key that was never set.
                    SyncOutcome::Ignored
                }
            }
            Some(StorageKey::AccessToken) => self.adopt_token_pair(),
            Some(StorageKey::RefreshToken) => {
                trace!("Refresh token changed in another tab; waiting for the access token");
                SyncOutcome::Ignored
            }
            _ => {
                debug!(key = %event.key, "Shared storage changed in another tab");
                SyncOutcome::Ignored
            }
        }
    }

    /// Reconciles memory with storage after events were dropped.
    pub fn resync(&self) -> SyncOutcome {
        let storage = self.store.storage();
        if storage.get(StorageKey::AccessToken.as_str()).is_none() {
            if self.store.is_authenticated() || self.store.access_token().is_some() {
                return self.remote_logout();
            }
            return SyncOutcome::Ignored;
        }
        self.adopt_token_pair()
    }

    fn adopt_token_pair(&self) -> SyncOutcome {
        let storage = self.store.storage();
        let (Some(access), Some(refresh)) = (
            storage.get(StorageKey::AccessToken.as_str()),
            storage.get(StorageKey::RefreshToken.as_str()),
        ) else {
            return SyncOutcome::Ignored;
        };

        let session = self.store.snapshot();
        if session.access_token.as_ref() == Some(&access)
            && session.refresh_token.as_ref() == Some(&refresh)
        {
            return SyncOutcome::Ignored;
        }

        self.store
            .apply_remote(SessionAction::UpdateTokens { access, refresh }, Utc::now());
        SyncOutcome::TokensUpdated
    }

    fn remote_logout(&self) -> SyncOutcome {
        info!("Signed out in another tab");
        self.store.apply_remote(SessionAction::Logout, Utc::now());
        self.navigator.redirect_to_login();
        SyncOutcome::LoggedOut
    }
}
