//! Single-flight token refresh shared by every API client in a tab.
//!
//! # Coordination
//!
//! ```text
//! caller A ─┐                        ┌─ success → store updated → A, B, C retry
//! caller B ─┼─► in-flight slot ──────┤
//! caller C ─┘   (one refresh call)   └─ failure → session cleared once → A, B, C fail
//! ```
//!
//! The slot is checked and filled under a synchronous lock, so two callers can
//! never both decide to start a refresh. The refresh itself runs as a spawned
//! task: waiters that give up do not cancel it, and its bookkeeping (clearing
//! the slot and the persisted in-progress flag, ending the session on failure)
//! runs exactly once no matter how many callers joined.
//!
//! Other tabs have no hard exclusion. They see `tokenRefreshInProgress` in shared
//! storage and converge on whichever token pair lands last.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use keystone_protocol::{StorageKey, REFRESH_IN_PROGRESS_VALUE};
use tracing::{debug, info, warn};

use crate::auth::request_refresh;
use crate::error::RefreshFailure;
use crate::navigation::Navigator;
use crate::session::TokenStore;
use crate::transport::Transport;

type RefreshOutcome = Result<String, RefreshFailure>;
type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// What asked for the refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOrigin {
    /// A request came back 401.
    Unauthorized,
    /// The idle monitor saw the access token about to expire.
    Proactive,
}

#[derive(Clone)]
pub struct ReauthCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<TokenStore>,
    transport: Arc<dyn Transport>,
    navigator: Arc<dyn Navigator>,
    in_flight: Mutex<Option<InFlight>>,
}

impl ReauthCoordinator {
    /// `transport` must be bare: refresh calls are never intercepted.
    pub fn new(
        store: Arc<TokenStore>,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                navigator,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        lock_slot(&self.inner.in_flight).is_some()
    }

    /// Waits for the refresh in flight, if any, to store its result and
    /// clear the in-progress flag.
    pub async fn settle(&self) {
        let in_flight = lock_slot(&self.inner.in_flight).clone();
        if let Some(in_flight) = in_flight {
            debug!("Waiting for in-flight token refresh");
            let _ = in_flight.await;
        }
    }

    /// Joins the in-flight refresh or starts one. Resolves to the new access
    /// token; on failure the session has already been ended.
    pub async fn refresh(&self, origin: RefreshOrigin) -> RefreshOutcome {
        let in_flight = {
            let mut slot = lock_slot(&self.inner.in_flight);
            match slot.as_ref() {
                Some(existing) => {
                    debug!(?origin, "Joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let task = tokio::spawn(run_refresh(Arc::clone(&self.inner), origin));
                    let shared = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(RefreshFailure::Transport(format!("refresh task failed: {err}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };

        in_flight.await
    }
}

async fn run_refresh(inner: Arc<Inner>, origin: RefreshOrigin) -> RefreshOutcome {
    let outcome = match inner.store.persisted_refresh_token() {
        None => Err(RefreshFailure::MissingRefreshToken),
        Some(refresh_token) => {
            set_progress_flag(&inner, true);
            info!(?origin, "Refreshing access token");
            let result = request_refresh(inner.transport.as_ref(), &refresh_token).await;
            set_progress_flag(&inner, false);

            // Both origins store the pair the same way; a refresh is not user
            // activity, so it must not stamp lastActivity.
            result.map(|response| {
                let access = response.access_token.clone();
                let refresh = response.refresh_token.unwrap_or(refresh_token);
                inner.store.update_tokens(response.access_token, refresh);
                access
            })
        }
    };

    *lock_slot(&inner.in_flight) = None;

    if let Err(failure) = &outcome {
        warn!(?origin, error = %failure, "Token refresh failed; ending session");
        inner.store.logout();
        inner.navigator.redirect_to_login();
    }
    outcome
}

fn set_progress_flag(inner: &Inner, in_progress: bool) {
    let storage = inner.store.storage();
    let key = StorageKey::TokenRefreshInProgress.as_str();
    let result = if in_progress {
        storage.set(key, REFRESH_IN_PROGRESS_VALUE)
    } else {
        storage.remove(key)
    };
    if let Err(err) = result {
        warn!(error = %err, in_progress, "Failed to update refresh-in-progress flag");
    }
}

fn lock_slot(slot: &Mutex<Option<InFlight>>) -> std::sync::MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::{RecordingNavigator, DEFAULT_ROUTE, LOGIN_ROUTE};
    use crate::storage::{MemoryStorage, SharedStorage};
    use crate::testing::ScriptedTransport;
    use crate::transport::ApiResponse;
    use chrono::Utc;
    use keystone_protocol::{AuthResponse, REFRESH_PATH};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        coordinator: ReauthCoordinator,
        store: Arc<TokenStore>,
        storage: Arc<MemoryStorage>,
        transport: Arc<ScriptedTransport>,
        navigator: Arc<RecordingNavigator>,
    }

    fn harness() -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(TokenStore::restore(storage.clone(), Utc::now()));
        store.set_credentials(AuthResponse {
            access_token: "a1".to_string(),
            refresh_token: "r1".to_string(),
            user_id: "42".to_string(),
            token_type: "bearer".to_string(),
            message: None,
        });
        let transport = Arc::new(ScriptedTransport::new());
        let navigator = Arc::new(RecordingNavigator::new(DEFAULT_ROUTE));
        let coordinator =
            ReauthCoordinator::new(store.clone(), transport.clone(), navigator.clone());
        Harness {
            coordinator,
            store,
            storage,
            transport,
            navigator,
        }
    }

    #[tokio::test]
    async fn keeps_old_refresh_token_when_not_rotated() {
        let h = harness();
        h.transport.route(REFRESH_PATH, |_| {
            ApiResponse::new(200, Some(json!({ "access_token": "a2" })))
        });

        let token = h
            .coordinator
            .refresh(RefreshOrigin::Unauthorized)
            .await
            .expect("refresh");

        assert_eq!(token, "a2");
        assert_eq!(h.store.refresh_token().as_deref(), Some("r1"));
        assert_eq!(h.storage.get("tokenRefreshInProgress"), None);
        assert!(!h.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn proactive_refresh_stores_rotated_pair() {
        let h = harness();
        h.transport.route(REFRESH_PATH, |_| {
            ApiResponse::new(
                200,
                Some(json!({ "access_token": "a2", "refresh_token": "r2" })),
            )
        });

        h.coordinator
            .refresh(RefreshOrigin::Proactive)
            .await
            .expect("refresh");

        assert_eq!(h.storage.get("accessToken").as_deref(), Some("a2"));
        assert_eq!(h.storage.get("refreshToken").as_deref(), Some("r2"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_call() {
        let h = harness();
        h.transport.route(REFRESH_PATH, |_| {
            ApiResponse::new(
                200,
                Some(json!({ "access_token": "a2", "refresh_token": "r2" })),
            )
        });
        h.transport.set_latency(REFRESH_PATH, Duration::from_millis(200));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let coordinator = h.coordinator.clone();
            tasks.push(tokio::spawn(async move {
                coordinator.refresh(RefreshOrigin::Unauthorized).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.coordinator.is_refreshing());
        assert_eq!(h.storage.get("tokenRefreshInProgress").as_deref(), Some("true"));

        for task in tasks {
            assert_eq!(task.await.expect("join").expect("refresh"), "a2");
        }
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        assert_eq!(h.storage.get("tokenRefreshInProgress"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_ends_session_once() {
        let h = harness();
        h.transport
            .route(REFRESH_PATH, |_| ApiResponse::new(401, None));
        h.transport.set_latency(REFRESH_PATH, Duration::from_millis(100));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let coordinator = h.coordinator.clone();
            tasks.push(tokio::spawn(async move {
                coordinator.refresh(RefreshOrigin::Unauthorized).await
            }));
        }
        for task in tasks {
            assert_eq!(
                task.await.expect("join"),
                Err(RefreshFailure::Rejected(401))
            );
        }

        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        assert!(!h.store.is_authenticated());
        assert_eq!(h.navigator.navigations(), vec![LOGIN_ROUTE.to_string()]);
        assert_eq!(h.storage.get("tokenRefreshInProgress"), None);
        assert!(!h.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_network() {
        let h = harness();
        h.storage.remove("refreshToken").expect("remove");

        let outcome = h.coordinator.refresh(RefreshOrigin::Unauthorized).await;

        assert_eq!(outcome, Err(RefreshFailure::MissingRefreshToken));
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 0);
        assert!(!h.store.is_authenticated());
        assert!(h.navigator.is_on_login());
    }

    #[tokio::test]
    async fn transport_error_is_a_refresh_failure() {
        let h = harness();
        h.transport.fail(REFRESH_PATH, "connection reset");

        let outcome = h.coordinator.refresh(RefreshOrigin::Proactive).await;

        assert!(matches!(outcome, Err(RefreshFailure::Transport(_))));
        assert!(!h.store.is_authenticated());
    }
}
