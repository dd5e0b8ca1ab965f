//! sessionward - command-line client for a persisted API session.
//!
//! Logs in against the configured auth service, keeps the session on disk
//! (or in the OS keychain with `--keyring`) and sends authenticated requests
//! that recover from expired tokens on their own.

use std::io;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionward_core::auth::{Navigator, REFRESH_CIRCUIT_KEY};
use sessionward_core::config::APP_NAME;
use sessionward_core::storage::{FileStorage, KeyValueStorage, KeyringStorage};
use sessionward_core::{Credentials, RegisterData, SessionConfig, SessionRuntime};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable overriding the API base URL
const API_URL_ENV: &str = "SESSIONWARD_API_URL";

/// Environment variable naming a directory for a daily rolling log file
const LOG_DIR_ENV: &str = "SESSIONWARD_LOG_DIR";

const USAGE: &str = "\
Usage: sessionward [--keyring] <command> [args]

Commands:
  login <email>            Sign in (prompts for the password)
  register <email> [name]  Create an account and sign in
  whoami                   Show the signed-in user
  refresh                  Exchange the refresh token for a new pair
  logout                   Sign out and invalidate the refresh token
  get <path>               Send an authenticated GET and print the JSON body
  status                   Show session and token expiry

Options:
  --keyring                Keep the session in the OS keychain instead of a file";

/// Initialize the tracing subscriber for logging.
///
/// Returns the appender guard when logging to a file; keep it alive until exit.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", APP_NAME));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// Tells the user where to go instead of navigating.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn current_path(&self) -> String {
        "/".to_string()
    }

    fn redirect_to(&self, _path: &str) {
        eprintln!("Signed out. Run `sessionward login <email>` to sign in again.");
    }
}

fn load_config() -> Result<SessionConfig> {
    let mut config = SessionConfig::load()?;
    if let Ok(url) = std::env::var(API_URL_ENV) {
        if !url.is_empty() {
            config.api_base_url = url;
        }
    }
    Ok(config)
}

fn open_session(use_keyring: bool) -> Result<SessionRuntime> {
    let config = load_config()?;
    let storage: Arc<dyn KeyValueStorage> = if use_keyring {
        Arc::new(KeyringStorage::default())
    } else {
        Arc::new(FileStorage::default_location()?)
    };

    SessionRuntime::builder(config)
        .storage(storage)
        .navigator(Arc::new(TerminalNavigator))
        .start()
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let log_guard = init_tracing();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let use_keyring = if let Some(pos) = args.iter().position(|a| a == "--keyring") {
        args.remove(pos);
        true
    } else {
        false
    };

    let Some(command) = args.first().cloned() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };
    if command == "--help" || command == "-h" || command == "help" {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut runtime = open_session(use_keyring)?;
    runtime.store().wait_for_hydration().await;
    info!(command = %command, "sessionward starting");

    let result = run(&runtime, &command, &args[1..]).await;
    runtime.shutdown();
    drop(runtime);
    drop(log_guard);

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(runtime: &SessionRuntime, command: &str, args: &[String]) -> Result<()> {
    let store = runtime.store();

    match command {
        "login" => {
            let email = args.first().ok_or_else(|| anyhow!("Usage: sessionward login <email>"))?;
            let password = rpassword::prompt_password("Password: ")?;
            let user = store
                .login(Credentials::new(email.as_str(), password))
                .await
                .map_err(|e| anyhow!(e.user_message()))?;
            println!("Signed in as {}", user.display_name());
        }
        "register" => {
            let email = args.first().ok_or_else(|| anyhow!("Usage: sessionward register <email> [name]"))?;
            let password = rpassword::prompt_password("Choose a password: ")?;
            let confirm = rpassword::prompt_password("Confirm password: ")?;
            if password != confirm {
                bail!("Passwords do not match");
            }
            let data = RegisterData {
                email: email.clone(),
                password,
                name: args.get(1).cloned(),
            };
            let user = store.register(data).await.map_err(|e| anyhow!(e.user_message()))?;
            println!("Registered and signed in as {}", user.display_name());
        }
        "whoami" => {
            if !store.is_authenticated() {
                bail!("Not signed in");
            }
            let expired = store
                .state()
                .access_token()
                .map(|t| t.is_expired())
                .unwrap_or(true);
            if expired {
                runtime
                    .coordinator()
                    .refresh()
                    .await
                    .map_err(|e| anyhow!(e.user_message()))?;
            }
            let user = store
                .get_current_user()
                .await
                .map_err(|e| anyhow!(e.user_message()))?;
            println!("{} <{}>", user.display_name(), user.email);
            if let Some(role) = user.role {
                println!("Role: {}", role);
            }
        }
        "refresh" => {
            if !store.is_authenticated() {
                bail!("Not signed in");
            }
            runtime
                .coordinator()
                .refresh()
                .await
                .map_err(|e| anyhow!(e.user_message()))?;
            let minutes = store.state().minutes_until_expiry().unwrap_or(0);
            println!("Token refreshed, valid for {} more minutes", minutes);
        }
        "logout" => {
            if !store.state().has_session() {
                println!("Not signed in");
                return Ok(());
            }
            store.logout().await;
        }
        "get" => {
            let path = args.first().ok_or_else(|| anyhow!("Usage: sessionward get <path>"))?;
            let body: Value = runtime
                .client()
                .get(path)
                .await
                .map_err(|e| anyhow!(e.user_message()))?;
            print_json(&body)?;
        }
        "status" => {
            let session = store.state();
            match &session.user {
                Some(user) if session.is_authenticated => {
                    println!("Signed in as {} <{}>", user.display_name(), user.email);
                }
                _ => println!("Not signed in"),
            }
            if let Some(at) = session.token_expires_at {
                let minutes = session.minutes_until_expiry().unwrap_or(0);
                println!("Access token expires {} ({} min)", at.to_rfc3339(), minutes);
            }
            if let Some(error) = &session.error {
                println!("Last error: {}", error);
            }
            let circuit = store.refresh_circuit().state(REFRESH_CIRCUIT_KEY).await;
            if circuit.failure_count > 0 {
                println!("Refresh failures: {}", circuit.failure_count);
            }
            println!("API: {}", runtime.config().api_base_url);
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command: {}", other);
        }
    }

    Ok(())
}
