//! # keystone-core
//!
//! Client-side session lifecycle for Keystone: keeps one authenticated session
//! alive across restarts, across tabs sharing the same storage, and across
//! long idle periods, while any number of API clients recover from expired
//! access tokens without the caller noticing.
//!
//! ## Design Principles
//!
//! - **One refresh per tab**: concurrent 401s and the proactive expiry check
//!   share a single in-flight refresh through [`ReauthCoordinator`].
//! - **Storage is the shared truth**: tabs never talk to each other directly.
//!   They write to [`SharedStorage`] and react to each other's writes.
//! - **Pure transitions**: [`reduce_session`] and [`reduce_idle`] hold the
//!   state machines; the async parts only feed them.
//! - **Host seams are traits**: [`Transport`], [`SharedStorage`] and
//!   [`Navigator`] are supplied by the host so tests can script all three.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keystone_core::{HttpTransport, KeystoneConfig, KeystonePaths, SessionRuntime};
//!
//! let paths = KeystonePaths::resolve()?;
//! let config = KeystoneConfig::load(&paths)?;
//! let transport = Arc::new(HttpTransport::new(&config)?);
//! let runtime = SessionRuntime::start_with_file_storage(&config, &paths, transport, navigator)?;
//!
//! runtime.auth().login("ada", "secret", "acme").await?;
//! let users: serde_json::Value = runtime
//!     .client()
//!     .scoped("/management/v1")
//!     .send_json(ApiRequest::get("users"))
//!     .await?;
//! ```

pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod idle;
pub mod navigation;
pub mod reauth;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod sync;
#[doc(hidden)]
pub mod testing;
pub mod token;
pub mod transport;

pub use auth::AuthApi;
pub use client::ApiClient;
pub use clock::SessionClock;
pub use config::{KeystoneConfig, KeystonePaths, SessionPolicy};
pub use error::{RefreshFailure, Result, SessionError};
pub use idle::{
    reduce_idle, ActivityHandle, ActivityKind, IdleEffect, IdleHandle, IdleInput, IdleMonitor,
    IdlePhase, IdlePolicy, IdleTransition,
};
pub use navigation::{Navigator, RecordingNavigator, DEFAULT_ROUTE, LOGIN_ROUTE};
pub use reauth::{ReauthCoordinator, RefreshOrigin};
pub use runtime::SessionRuntime;
pub use session::{reduce_session, Session, SessionAction, SessionUser, TokenStore};
pub use storage::{FileStorage, MemoryStorage, SharedStorage, StorageEvent};
pub use sync::{SyncOutcome, TabSync};
pub use token::{TokenClaims, TokenError, TokenValidity};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
