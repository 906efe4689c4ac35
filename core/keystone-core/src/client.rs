//! API client with transparent reauthentication.
//!
//! Every REST surface of the backend (`/management`, `/migration`,
//! `/translation`, ...) goes through one [`ApiClient`]; they differ only in
//! base path. A 401 on an authenticated request triggers at most one shared
//! refresh (see [`crate::reauth`]) followed by exactly one retry. The retry's
//! outcome is returned as is, whatever its status.

use std::sync::Arc;

use keystone_protocol::is_refresh_path;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::reauth::{ReauthCoordinator, RefreshOrigin};
use crate::session::TokenStore;
use crate::transport::{ApiRequest, ApiResponse, Transport};

#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: Arc<TokenStore>,
    reauth: ReauthCoordinator,
    base_path: String,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<TokenStore>,
        reauth: ReauthCoordinator,
    ) -> Self {
        Self {
            transport,
            store,
            reauth,
            base_path: String::new(),
        }
    }

    /// A client for one backend surface, e.g. `/management/v1`.
    pub fn scoped(&self, base_path: &str) -> Self {
        Self {
            base_path: join_paths(&self.base_path, base_path),
            ..self.clone()
        }
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let request = ApiRequest {
            path: join_paths(&self.base_path, &request.path),
            ..request
        };

        if !request.authenticated || is_refresh_path(&request.path) {
            return self.transport.execute(&request).await;
        }

        let sent_with = self.store.access_token();
        let response = self
            .transport
            .execute(&request.clone().with_bearer(sent_with.clone()))
            .await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(path = %request.path, "Request unauthorized; reauthenticating");
        let current = self.store.access_token();
        let token = if current.is_some() && current != sent_with {
            // Someone refreshed while this request was in flight.
            current
        } else {
            let refreshed = self
                .reauth
                .refresh(RefreshOrigin::Unauthorized)
                .await
                .map_err(SessionError::SessionExpired)?;
            self.store.access_token().or(Some(refreshed))
        };

        self.transport.execute(&request.with_bearer(token)).await
    }

    /// Sends `request` and decodes a 2xx JSON body; any other status is an error.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let path = join_paths(&self.base_path, &request.path);
        self.send(request)
            .await?
            .error_for_status(&path)?
            .json(&path)
    }
}

fn join_paths(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::{Navigator, RecordingNavigator, DEFAULT_ROUTE, LOGIN_ROUTE};
    use crate::storage::{MemoryStorage, SharedStorage};
    use crate::testing::ScriptedTransport;
    use chrono::Utc;
    use keystone_protocol::{AuthResponse, REFRESH_PATH};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    const USERS_PATH: &str = "/management/v1/users";

    struct Harness {
        client: ApiClient,
        store: Arc<TokenStore>,
        storage: Arc<MemoryStorage>,
        transport: Arc<ScriptedTransport>,
        navigator: Arc<RecordingNavigator>,
        valid_token: Arc<Mutex<String>>,
    }

    /// Backend whose protected route accepts only `valid_token`, and whose
    /// refresh endpoint rotates it to `a2`.
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

        let valid_token = Arc::new(Mutex::new("a2".to_string()));
        let transport = Arc::new(ScriptedTransport::new());
        let accepted = valid_token.clone();
        transport.route(USERS_PATH, move |request| {
            let expected = accepted.lock().expect("token lock").clone();
            if request.bearer.as_deref() == Some(expected.as_str()) {
                ApiResponse::new(200, Some(json!([{ "id": 1 }])))
            } else {
                ApiResponse::new(401, Some(json!({ "detail": "token expired" })))
            }
        });
        transport.route(REFRESH_PATH, |_| {
            ApiResponse::new(
                200,
                Some(json!({ "access_token": "a2", "refresh_token": "r2" })),
            )
        });

        let navigator = Arc::new(RecordingNavigator::new(DEFAULT_ROUTE));
        let reauth = ReauthCoordinator::new(store.clone(), transport.clone(), navigator.clone());
        let client = ApiClient::new(transport.clone(), store.clone(), reauth);
        Harness {
            client,
            store,
            storage,
            transport,
            navigator,
            valid_token,
        }
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_transparently() {
        let h = harness();

        let users: Value = h
            .client
            .send_json(ApiRequest::get(USERS_PATH))
            .await
            .expect("caller never sees the 401");

        assert_eq!(users, json!([{ "id": 1 }]));
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        assert_eq!(h.store.access_token().as_deref(), Some("a2"));
        assert_eq!(h.storage.get("refreshToken").as_deref(), Some("r2"));
        let bearers: Vec<_> = h
            .transport
            .requests()
            .into_iter()
            .filter(|request| request.path == USERS_PATH)
            .map(|request| request.bearer)
            .collect();
        assert_eq!(bearers, vec![Some("a1".to_string()), Some("a2".to_string())]);
    }

    #[tokio::test]
    async fn valid_token_makes_no_refresh() {
        let h = harness();
        *h.valid_token.lock().expect("token lock") = "a1".to_string();

        let response = h.client.send(ApiRequest::get(USERS_PATH)).await.expect("send");

        assert_eq!(response.status, 200);
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn retried_failure_is_returned_without_second_refresh() {
        let h = harness();
        *h.valid_token.lock().expect("token lock") = "never".to_string();

        let err = h
            .client
            .send_json::<Value>(ApiRequest::get(USERS_PATH))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        assert_eq!(h.transport.calls_to(USERS_PATH), 2);
        assert!(h.store.is_authenticated());
    }

    #[tokio::test]
    async fn refresh_endpoint_is_never_intercepted() {
        let h = harness();
        h.transport
            .route(REFRESH_PATH, |_| ApiResponse::new(401, None));

        let response = h
            .client
            .send(ApiRequest::post(REFRESH_PATH, None).with_query("refresh_token", "r1"))
            .await
            .expect("send");

        assert_eq!(response.status, 401);
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        assert!(h.store.is_authenticated());
    }

    #[tokio::test]
    async fn missing_refresh_token_logs_out_without_network() {
        let h = harness();
        h.storage.remove("refreshToken").expect("remove");

        let err = h.client.send(ApiRequest::get(USERS_PATH)).await.unwrap_err();

        assert!(err.is_session_expired());
        assert_eq!(h.transport.calls_to(REFRESH_PATH), 0);
        assert_eq!(h.transport.calls_to(USERS_PATH), 1);
        assert!(!h.store.is_authenticated());
        assert_eq!(h.navigator.navigations(), vec![LOGIN_ROUTE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_unauthorized_requests_share_one_refresh() {
        let h = harness();
        h.transport.set_latency(REFRESH_PATH, Duration::from_millis(300));
        h.transport.set_latency(USERS_PATH, Duration::from_millis(10));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let client = h.client.clone();
            tasks.push(tokio::spawn(async move {
                client.send(ApiRequest::get(USERS_PATH)).await
            }));
        }
        for task in tasks {
            let response = task.await.expect("join").expect("send");
            assert_eq!(response.status, 200);
        }

        assert_eq!(h.transport.calls_to(REFRESH_PATH), 1);
        let retried_with: Vec<_> = h
            .transport
            .requests()
            .into_iter()
            .filter(|request| request.path == USERS_PATH && request.bearer.as_deref() == Some("a2"))
            .collect();
        assert_eq!(retried_with.len(), 8);
        assert!(!h.navigator.is_on_login());
    }

    #[tokio::test]
    async fn unauthenticated_requests_skip_bearer() {
        let h = harness();
        h.transport
            .route("/translation/v1/languages", |request| {
                assert!(request.bearer.is_none());
                ApiResponse::new(200, Some(json!(["en"])))
            });

        let response = h
            .client
            .send(ApiRequest::get("/translation/v1/languages").unauthenticated())
            .await
            .expect("send");
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn scoped_client_prefixes_paths() {
        let h = harness();
        *h.valid_token.lock().expect("token lock") = "a1".to_string();
        let management = h.client.scoped("/management/v1");

        let response = management.send(ApiRequest::get("users")).await.expect("send");

        assert_eq!(response.status, 200);
        assert_eq!(h.transport.calls_to(USERS_PATH), 1);
    }

    #[test]
    fn join_paths_handles_slashes() {
        assert_eq!(join_paths("", "/a"), "/a");
        assert_eq!(join_paths("/api/", "/a"), "/api/a");
        assert_eq!(join_paths("/api", "a"), "/api/a");
        assert_eq!(join_paths("/api", ""), "/api");
    }
}
