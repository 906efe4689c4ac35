//! Subcommand implementations. Each one opens the file-backed session, does
//! its work and shuts the runtime down again.

use std::io::BufRead;
use std::sync::Arc;

use chrono::Utc;
use keystone_core::{
    ActivityKind, ApiRequest, HttpTransport, IdlePhase, KeystoneConfig, KeystonePaths, Method,
    Navigator, RecordingNavigator, SessionError, SessionRuntime, SharedStorage, DEFAULT_ROUTE,
    LOGIN_ROUTE,
};
use keystone_protocol::StorageKey;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Request body is not valid JSON: {0}")]
    InvalidBody(#[source] serde_json::Error),

    #[error("Failed to read password from stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("Request failed with HTTP {0}")]
    RequestFailed(u16),
}

pub type CliResult<T> = std::result::Result<T, CliError>;

pub struct Context {
    pub paths: KeystonePaths,
    pub config: KeystoneConfig,
}

impl Context {
    pub fn load(base_url: Option<String>) -> CliResult<Self> {
        let paths = KeystonePaths::resolve()?;
        let mut config = KeystoneConfig::load(&paths)?;
        if let Some(base_url) = base_url {
            config.base_url = base_url;
            config.validate()?;
        }
        Ok(Self { paths, config })
    }

    fn start(&self, route: &str) -> CliResult<(SessionRuntime, Arc<RecordingNavigator>)> {
        let transport = Arc::new(HttpTransport::new(&self.config)?);
        let navigator = Arc::new(RecordingNavigator::new(route));
        let runtime = SessionRuntime::start_with_file_storage(
            &self.config,
            &self.paths,
            transport,
            navigator.clone(),
        )?;
        Ok((runtime, navigator))
    }
}

pub async fn login(
    ctx: &Context,
    username: &str,
    password: Option<String>,
    domain: &str,
) -> CliResult<()> {
    let password = match password {
        Some(password) => password,
        None => read_password()?,
    };

    let (runtime, _) = ctx.start(LOGIN_ROUTE)?;
    let result = runtime.auth().login(username, &password, domain).await;
    runtime.shutdown().await;

    let session = result?;
    let user_id = session.user.map(|user| user.id).unwrap_or_default();
    println!("Signed in as {username} (user {user_id})");
    Ok(())
}

pub async fn logout(ctx: &Context) -> CliResult<()> {
    let (runtime, _) = ctx.start(DEFAULT_ROUTE)?;
    if !runtime.session().is_authenticated {
        runtime.shutdown().await;
        println!("Already signed out");
        return Ok(());
    }

    runtime.auth().logout().await;
    runtime.shutdown().await;
    println!("Signed out");
    Ok(())
}

pub async fn status(ctx: &Context) -> CliResult<()> {
    let (runtime, _) = ctx.start(DEFAULT_ROUTE)?;
    let session = runtime.session();
    let refreshing = runtime
        .store()
        .storage()
        .get(StorageKey::TokenRefreshInProgress.as_str())
        .is_some();
    runtime.shutdown().await;

    let expiry = match session.access_token_expires_at() {
        Ok(expires_at) => json!({
            "expires_at": expires_at,
            "expired": expires_at <= Utc::now(),
        }),
        Err(SessionError::NotAuthenticated) => Value::Null,
        Err(err) => json!(err.to_string()),
    };

    let mut report = serde_json::to_value(&session).unwrap_or(Value::Null);
    if let Value::Object(fields) = &mut report {
        fields.insert("access_token".to_string(), expiry);
        fields.insert("refresh_in_progress".to_string(), json!(refreshing));
        fields.insert("base_url".to_string(), json!(ctx.config.base_url));
        fields.insert(
            "store".to_string(),
            json!(ctx.paths.store_file().display().to_string()),
        );
    }
    println!("{}", pretty(&report));
    Ok(())
}

pub async fn request(
    ctx: &Context,
    method: Method,
    path: &str,
    body: Option<String>,
) -> CliResult<()> {
    let body = body
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(CliError::InvalidBody)?;

    let (runtime, _) = ctx.start(DEFAULT_ROUTE)?;
    if !runtime.session().is_authenticated {
        runtime.shutdown().await;
        return Err(SessionError::NotAuthenticated.into());
    }

    let mut api_request = ApiRequest::new(method, path);
    if let Some(body) = body {
        api_request = api_request.with_body(body);
    }
    let result = runtime.client().send(api_request).await;
    runtime.shutdown().await;

    let response = result?;
    debug!(status = response.status, "Request finished");
    if let Some(body) = &response.body {
        println!("{}", pretty(body));
    }
    if !response.is_success() {
        return Err(CliError::RequestFailed(response.status));
    }
    Ok(())
}

/// Keeps the session alive in the foreground: every stdin line counts as a
/// key press and `stay` answers the logout warning. Ends on Ctrl-C or when the
/// session ends.
pub async fn watch(ctx: &Context) -> CliResult<()> {
    let (runtime, navigator) = ctx.start(DEFAULT_ROUTE)?;
    if !runtime.session().is_authenticated {
        runtime.shutdown().await;
        return Err(SessionError::NotAuthenticated.into());
    }

    let activity = runtime.activity();
    let mut phases = runtime.subscribe_idle();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("Watching session; type `stay` to dismiss a warning, Ctrl-C to quit");
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            changed = phases.changed() => {
                if changed.is_err() {
                    break;
                }
                let phase = *phases.borrow_and_update();
                println!("{}", describe(phase));
                if phase == IdlePhase::LoggedOut {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim() == "stay" => runtime.stay_active(),
                Ok(Some(_)) => activity.record(ActivityKind::KeyPress),
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    let route = navigator.current_route();
    runtime.shutdown().await;
    debug!(route = %route, "Watch finished");
    Ok(())
}

pub fn config(ctx: &Context, save: bool) -> CliResult<()> {
    if save {
        ctx.config.save(&ctx.paths)?;
        info!(path = %ctx.paths.config_file().display(), "Configuration saved");
    }
    let value = serde_json::to_value(&ctx.config).unwrap_or(Value::Null);
    println!("{}", pretty(&value));
    Ok(())
}

fn describe(phase: IdlePhase) -> String {
    match phase {
        IdlePhase::Active => "active".to_string(),
        IdlePhase::Warning { remaining_secs } => {
            format!("inactive: signing out in {remaining_secs}s")
        }
        IdlePhase::LoggedOut => "signed out".to_string(),
    }
}

fn read_password() -> CliResult<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(CliError::Stdin)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
