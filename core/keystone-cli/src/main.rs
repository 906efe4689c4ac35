//! keystone: command-line host for the Keystone session lifecycle.
//!
//! Keeps its session in `~/.keystone/store.json` (or `$KEYSTONE_HOME`), so
//! several `keystone` processes behave like tabs sharing one login.
//!
//! ## Subcommands
//!
//! - `login`: Authenticate and persist the token pair
//! - `logout`: End the session here and in every other process
//! - `status`: Print the persisted session
//! - `request`: Call the API with transparent token refresh
//! - `watch`: Run the idle monitor in the foreground
//! - `config`: Show or persist the effective configuration

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use keystone_core::{KeystonePaths, Method};

#[derive(Parser)]
#[command(name = "keystone")]
#[command(about = "Keystone session client")]
#[command(version)]
struct Cli {
    /// API base URL (overrides config and KEYSTONE_BASE_URL)
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in (reads the password from stdin when --password is omitted)
    Login {
        #[arg(value_name = "USERNAME")]
        username: String,

        /// Tenant domain
        #[arg(long)]
        domain: String,

        #[arg(long)]
        password: Option<String>,
    },

    /// Sign out
    Logout,

    /// Show the current session
    Status,

    /// Send an authenticated API request
    Request {
        #[arg(value_name = "METHOD", value_parser = parse_method)]
        method: Method,

        /// Path relative to the base URL, e.g. /management/v1/users
        #[arg(value_name = "PATH")]
        path: String,

        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },

    /// Keep the session in the foreground until Ctrl-C or logout
    Watch,

    /// Print the effective configuration
    Config {
        /// Write it to config.json
        #[arg(long)]
        save: bool,
    },
}

fn parse_method(value: &str) -> Result<Method, String> {
    Method::parse(value).ok_or_else(|| format!("unsupported method: {value}"))
}

#[tokio::main]
async fn main() {
    let logs_dir = KeystonePaths::resolve().ok().map(|paths| paths.logs_dir());
    let _logging_guard = logging::init(logs_dir.as_deref());
    let cli = Cli::parse();

    let ctx = match commands::Context::load(cli.base_url) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Login {
            username,
            domain,
            password,
        } => commands::login(&ctx, &username, password, &domain).await,
        Commands::Logout => commands::logout(&ctx).await,
        Commands::Status => commands::status(&ctx).await,
        Commands::Request { method, path, body } => {
            commands::request(&ctx, method, &path, body).await
        }
        Commands::Watch => commands::watch(&ctx).await,
        Commands::Config { save } => commands::config(&ctx, save),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "keystone command failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_request_subcommand() {
        let cli = Cli::try_parse_from([
            "keystone",
            "--base-url",
            "https://api.example.com",
            "request",
            "post",
            "/management/v1/users",
            "--body",
            r#"{"name":"ada"}"#,
        ])
        .expect("parse");

        assert_eq!(cli.base_url.as_deref(), Some("https://api.example.com"));
        match cli.command {
            Commands::Request { method, path, body } => {
                assert_eq!(method, Method::Post);
                assert_eq!(path, "/management/v1/users");
                assert_eq!(body.as_deref(), Some(r#"{"name":"ada"}"#));
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(Cli::try_parse_from(["keystone", "request", "TRACE", "/x"]).is_err());
    }

    #[test]
    fn login_requires_domain() {
        assert!(Cli::try_parse_from(["keystone", "login", "ada"]).is_err());
        assert!(Cli::try_parse_from(["keystone", "login", "ada", "--domain", "acme"]).is_ok());
    }
}
