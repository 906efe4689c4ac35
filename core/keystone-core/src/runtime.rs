//! Wires one tab's session components together.
//!
//! ```text
//! SessionRuntime
//!   ├─ TokenStore          restored from shared storage
//!   ├─ ReauthCoordinator   one per tab, shared by every client
//!   ├─ ApiClient / AuthApi
//!   ├─ IdleMonitor task    idle timeout + proactive refresh
//!   ├─ TabSync task        applies other tabs' writes
//!   └─ storage watcher     file backend only
//! ```
//!
//! Must be started from within a tokio runtime.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::auth::AuthApi;
use crate::client::ApiClient;
use crate::config::{KeystoneConfig, KeystonePaths};
use crate::error::Result;
use crate::idle::{ActivityHandle, IdleHandle, IdleMonitor, IdlePhase, IdlePolicy};
use crate::navigation::Navigator;
use crate::reauth::ReauthCoordinator;
use crate::session::{Session, TokenStore};
use crate::storage::{FileStorage, SharedStorage};
use crate::sync::TabSync;
use crate::transport::Transport;

pub struct SessionRuntime {
    store: Arc<TokenStore>,
    reauth: ReauthCoordinator,
    client: ApiClient,
    auth: AuthApi,
    idle: IdleHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionRuntime {
    pub fn start(
        config: &KeystoneConfig,
        storage: Arc<dyn SharedStorage>,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let store = Arc::new(TokenStore::restore(storage, Utc::now()));
        let reauth = ReauthCoordinator::new(store.clone(), transport.clone(), navigator.clone());
        let client = ApiClient::new(transport.clone(), store.clone(), reauth.clone());
        let auth = AuthApi::new(transport, store.clone(), navigator.clone());

        let sync = TabSync::new(store.clone(), navigator.clone()).spawn();
        let idle = IdleMonitor::new(
            store.clone(),
            reauth.clone(),
            navigator,
            IdlePolicy::from(&config.policy),
        )
        .spawn();

        info!(
            authenticated = store.is_authenticated(),
            base_url = %config.base_url,
            "Session runtime started"
        );

        Self {
            store,
            reauth,
            client,
            auth,
            idle,
            tasks: vec![sync],
        }
    }

    /// Starts on the file-backed store under `paths`, watching it for writes
    /// from other processes.
    pub fn start_with_file_storage(
        config: &KeystoneConfig,
        paths: &KeystonePaths,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self> {
        let storage = Arc::new(FileStorage::open(&paths.store_file())?);
        let watcher = storage.spawn_watcher(config.policy.storage_poll_interval());
        debug!(path = %storage.path().display(), "Watching shared storage");

        let mut runtime = Self::start(config, storage, transport, navigator);
        runtime.tasks.push(watcher);
        Ok(runtime)
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn session(&self) -> Session {
        self.store.snapshot()
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn auth(&self) -> &AuthApi {
        &self.auth
    }

    pub fn reauth(&self) -> &ReauthCoordinator {
        &self.reauth
    }

    pub fn activity(&self) -> ActivityHandle {
        self.idle.activity()
    }

    pub fn stay_active(&self) {
        self.idle.stay_active();
    }

    pub fn idle_phase(&self) -> IdlePhase {
        self.idle.phase()
    }

    pub fn subscribe_idle(&self) -> watch::Receiver<IdlePhase> {
        self.idle.subscribe()
    }

    /// Stops every timer and background task. A refresh already in flight
    /// is seen through first so its tokens are stored and the in-progress
    /// flag cleared; otherwise the persisted session is left as is.
    pub async fn shutdown(self) {
        self.idle.shutdown().await;
        self.reauth.settle().await;
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Session runtime stopped");
    }
}
