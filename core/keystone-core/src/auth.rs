//! Calls against the `/auth` endpoints.
//!
//! Login and refresh go through a bare transport: neither may ever be
//! intercepted, or a failing refresh would try to refresh itself.

use std::sync::Arc;

use keystone_protocol::{
    parse_auth_response, parse_refresh_response, LoginRequest, RefreshResponse, LOGIN_PATH,
    LOGOUT_PATH, REFRESH_PATH, REFRESH_QUERY_PARAM,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{RefreshFailure, Result, SessionError};
use crate::navigation::{Navigator, DEFAULT_ROUTE};
use crate::session::{Session, TokenStore};
use crate::transport::{ApiRequest, Transport};

/// Exchanges `refresh_token` for a new token pair. Exactly one network call.
pub async fn request_refresh(
    transport: &dyn Transport,
    refresh_token: &str,
) -> std::result::Result<RefreshResponse, RefreshFailure> {
    let request = ApiRequest::post(REFRESH_PATH, None)
        .with_query(REFRESH_QUERY_PARAM, refresh_token)
        .unauthenticated();

    let response = transport
        .execute(&request)
        .await
        .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
    if !response.is_success() {
        return Err(RefreshFailure::Rejected(response.status));
    }

    parse_refresh_response(response.body.unwrap_or(Value::Null))
        .map_err(|info| RefreshFailure::Malformed(info.to_string()))
}

pub struct AuthApi {
    transport: Arc<dyn Transport>,
    store: Arc<TokenStore>,
    navigator: Arc<dyn Navigator>,
}

impl AuthApi {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<TokenStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            transport,
            store,
            navigator,
        }
    }

    /// Authenticates and stores the returned credentials.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        domain_name: &str,
    ) -> Result<Session> {
        let body = serde_json::to_value(LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
            domain_name: domain_name.to_string(),
        })
        .map_err(|err| SessionError::MalformedResponse {
            path: LOGIN_PATH.to_string(),
            details: err.to_string(),
        })?;

        let request = ApiRequest::post(LOGIN_PATH, Some(body)).unauthenticated();
        let response = self
            .transport
            .execute(&request)
            .await?
            .error_for_status(LOGIN_PATH)?;

        let credentials = parse_auth_response(response.body.unwrap_or(Value::Null)).map_err(
            |info| SessionError::MalformedResponse {
                path: LOGIN_PATH.to_string(),
                details: info.to_string(),
            },
        )?;

        info!(user_id = %credentials.user_id, domain = domain_name, "Login succeeded");
        self.store.set_credentials(credentials);
        if self.navigator.is_on_login() {
            self.navigator.navigate(DEFAULT_ROUTE);
        }
        Ok(self.store.snapshot())
    }

    /// Ends the session. The server call is best-effort; the local session is
    /// always cleared.
    pub async fn logout(&self) {
        if let Some(token) = self.store.access_token() {
            let request = ApiRequest::post(LOGOUT_PATH, None)
                .unauthenticated()
                .with_bearer(Some(token));
            match self.transport.execute(&request).await {
                Ok(response) if response.is_success() => {}
                Ok(response) => {
                    warn!(status = response.status, "Server logout rejected; clearing locally")
                }
                Err(err) => warn!(error = %err, "Server logout failed; clearing locally"),
            }
        }

        self.store.logout();
        self.navigator.redirect_to_login();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::{RecordingNavigator, LOGIN_ROUTE};
    use crate::storage::{MemoryStorage, SharedStorage};
    use crate::testing::ScriptedTransport;
    use crate::transport::ApiResponse;
    use chrono::Utc;
    use serde_json::json;

    type Fixture = (
        AuthApi,
        Arc<TokenStore>,
        Arc<RecordingNavigator>,
        Arc<MemoryStorage>,
    );

    fn setup(transport: Arc<ScriptedTransport>) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(TokenStore::restore(storage.clone(), Utc::now()));
        let navigator = Arc::new(RecordingNavigator::new(LOGIN_ROUTE));
        let api = AuthApi::new(transport, store.clone(), navigator.clone());
        (api, store, navigator, storage)
    }

    #[tokio::test]
    async fn login_stores_credentials_and_leaves_login_route() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(LOGIN_PATH, |request| {
            assert_eq!(
                request.body,
                Some(json!({ "username": "ada", "password": "pw", "domain_name": "acme" }))
            );
            assert!(request.bearer.is_none());
            ApiResponse::new(
                200,
                Some(json!({
                    "access_token": "a1",
                    "refresh_token": "r1",
                    "user_id": "42",
                    "token_type": "bearer",
                    "message": "ok"
                })),
            )
        });
        let (api, store, navigator, storage) = setup(transport);

        let session = api.login("ada", "pw", "acme").await.expect("login");

        assert!(session.is_authenticated);
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert_eq!(storage.get("refreshToken").as_deref(), Some("r1"));
        assert_eq!(navigator.navigations(), vec![DEFAULT_ROUTE.to_string()]);
    }

    #[tokio::test]
    async fn rejected_login_leaves_session_empty() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(LOGIN_PATH, |_| {
            ApiResponse::new(401, Some(json!({ "detail": "bad credentials" })))
        });
        let (api, store, _, _) = setup(transport);

        let err = api.login("ada", "wrong", "acme").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn logout_clears_session_even_when_server_fails() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route(LOGOUT_PATH, |request| {
            assert_eq!(request.bearer.as_deref(), Some("a1"));
            ApiResponse::new(500, None)
        });
        let (api, store, navigator, storage) = setup(transport.clone());
        store.set_credentials(keystone_protocol::AuthResponse {
            access_token: "a1".to_string(),
            refresh_token: "r1".to_string(),
            user_id: "42".to_string(),
            token_type: "bearer".to_string(),
            message: None,
        });
        navigator.navigate(DEFAULT_ROUTE);

        api.logout().await;

        assert!(!store.is_authenticated());
        assert_eq!(storage.get("accessToken"), None);
        assert_eq!(transport.calls_to(LOGOUT_PATH), 1);
        assert!(navigator.is_on_login());
    }

    #[tokio::test]
    async fn refresh_rejects_malformed_body() {
        let transport = ScriptedTransport::new();
        transport.route(REFRESH_PATH, |request| {
            assert_eq!(
                request.query,
                vec![("refresh_token".to_string(), "r1".to_string())]
            );
            ApiResponse::new(200, Some(json!({ "token": "x" })))
        });

        let err = request_refresh(&transport, "r1").await.unwrap_err();
        assert!(matches!(err, RefreshFailure::Malformed(_)));
    }
}
