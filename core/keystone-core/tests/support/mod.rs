//! Scripted backend shared by the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use keystone_core::testing::ScriptedTransport;
use keystone_core::{ApiResponse, MemoryStorage, RecordingNavigator, DEFAULT_ROUTE};
use keystone_protocol::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
use serde_json::json;

pub const USERS_PATH: &str = "/management/v1/users";

pub fn jwt(expires_at: DateTime<Utc>, generation: u32) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = json!({
        "exp": expires_at.timestamp(),
        "sub": "42",
        "tenant_id": "acme",
        "gen": generation,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

#[derive(Default)]
struct Issued {
    generation: u32,
    access: Option<String>,
    refresh: Option<String>,
}

/// Fake auth server: issues token pairs, rotates them on refresh and accepts
/// only the newest access token on [`USERS_PATH`].
pub struct Backend {
    pub transport: Arc<ScriptedTransport>,
    issued: Arc<Mutex<Issued>>,
}

impl Backend {
    pub fn new() -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        let issued = Arc::new(Mutex::new(Issued::default()));

        let state = issued.clone();
        transport.route(LOGIN_PATH, move |_| {
            let (access, refresh) = issue(&state);
            ApiResponse::new(
                200,
                Some(json!({
                    "access_token": access,
                    "refresh_token": refresh,
                    "user_id": "42",
                    "token_type": "bearer",
                })),
            )
        });

        let state = issued.clone();
        transport.route(REFRESH_PATH, move |request| {
            let presented = request
                .query
                .iter()
                .find(|(key, _)| key == "refresh_token")
                .map(|(_, value)| value.clone());
            let current = state.lock().expect("issued").refresh.clone();
            if presented.is_none() || presented != current {
                return ApiResponse::new(401, Some(json!({ "detail": "invalid refresh token" })));
            }
            let (access, refresh) = issue(&state);
            ApiResponse::new(
                200,
                Some(json!({ "access_token": access, "refresh_token": refresh })),
            )
        });

        let state = issued.clone();
        transport.route(USERS_PATH, move |request| {
            let current = state.lock().expect("issued").access.clone();
            if request.bearer.is_some() && request.bearer == current {
                ApiResponse::new(200, Some(json!([{ "id": 1, "name": "ada" }])))
            } else {
                ApiResponse::new(401, Some(json!({ "detail": "token expired" })))
            }
        });

        transport.route(LOGOUT_PATH, |_| ApiResponse::new(200, None));

        Self { transport, issued }
    }

    /// Server-side expiry: the current access token stops being accepted.
    pub fn expire_access_token(&self) {
        self.issued.lock().expect("issued").access = None;
    }

    /// Server-side revocation of the refresh token as well.
    pub fn revoke_session(&self) {
        let mut issued = self.issued.lock().expect("issued");
        issued.access = None;
        issued.refresh = None;
    }

    pub fn current_refresh_token(&self) -> Option<String> {
        self.issued.lock().expect("issued").refresh.clone()
    }
}

fn issue(state: &Mutex<Issued>) -> (String, String) {
    let mut issued = state.lock().expect("issued");
    issued.generation += 1;
    let access = jwt(Utc::now() + Duration::hours(1), issued.generation);
    let refresh = format!("refresh-{}", issued.generation);
    issued.access = Some(access.clone());
    issued.refresh = Some(refresh.clone());
    (access, refresh)
}

pub fn navigator() -> Arc<RecordingNavigator> {
    Arc::new(RecordingNavigator::new(DEFAULT_ROUTE))
}

pub fn hub() -> MemoryStorage {
    MemoryStorage::new()
}
