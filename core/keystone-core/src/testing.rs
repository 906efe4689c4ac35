//! Test doubles for hosts and integration tests.
//!
//! [`ScriptedTransport`] answers requests from per-path handlers and records
//! every call so tests can count, for example, how many refreshes were issued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SessionError};
use crate::transport::{ApiRequest, ApiResponse, Transport};

type Handler = Arc<dyn Fn(&ApiRequest) -> ApiResponse + Send + Sync>;

#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Handler>>,
    latency: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers requests to `path` (query string ignored) with `handler`.
    pub fn route(
        &self,
        path: &str,
        handler: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static,
    ) {
        lock(&self.routes).insert(path.to_string(), Arc::new(handler));
    }

    /// Delays every response on `path` by `delay` (tokio time, so pausable).
    pub fn set_latency(&self, path: &str, delay: Duration) {
        lock(&self.latency).insert(path.to_string(), delay);
    }

    /// Makes every request to `path` fail at the transport level.
    pub fn fail(&self, path: &str, details: &str) {
        lock(&self.failures).insert(path.to_string(), details.to_string());
    }

    pub fn calls_to(&self, path: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        lock(&self.calls).push(request.clone());

        let delay = lock(&self.latency).get(&request.path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = lock(&self.failures).get(&request.path).cloned();
        if let Some(details) = failure {
            return Err(SessionError::Transport {
                path: request.path.clone(),
                details,
            });
        }

        let handler = lock(&self.routes).get(&request.path).cloned();
        Ok(match handler {
            Some(handler) => handler(request),
            None => ApiResponse::new(404, None),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
