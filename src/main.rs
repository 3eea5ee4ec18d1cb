//! Usage: `oauth-relay <url> [username password]`: fetches `url` with the shared grant,
//! logging in first when credentials are given.
//!
//! Settings come from `$OAUTH_RELAY_SETTINGS` (default `oauth-relay.json`); file logs go to
//! `$OAUTH_RELAY_LOG_DIR` when set.

use oauth_relay_lib::app::bootstrap::{start_service, SettingsBootstrap};
use oauth_relay_lib::app::logging::{self, LogConfig};
use oauth_relay_lib::infra::settings;
use oauth_relay_lib::{AppError, AppResult, BearerRequest, ReqwestTransport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const ENV_SETTINGS_PATH: &str = "OAUTH_RELAY_SETTINGS";
const ENV_LOG_DIR: &str = "OAUTH_RELAY_LOG_DIR";
const DEFAULT_SETTINGS_FILE: &str = "oauth-relay.json";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let _log_guard = logging::init(&LogConfig {
        log_dir: std::env::var_os(ENV_LOG_DIR).map(PathBuf::from),
        ..LogConfig::default()
    })?;

    let mut args = std::env::args().skip(1);
    let url = args.next().ok_or_else(|| {
        AppError::from("SEC_INVALID_INPUT: usage: oauth-relay <url> [username password]")
    })?;
    let credentials = match (args.next(), args.next()) {
        (Some(username), Some(password)) => Some((username, password)),
        _ => None,
    };

    let settings_path = std::env::var_os(ENV_SETTINGS_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
    let mut settings = settings::read(&settings_path)?;
    if settings.apply_env_overrides() {
        tracing::info!("settings overridden from environment");
    }

    let service = start_service(&settings, &SettingsBootstrap::new(&settings))?;
    if let Some((username, password)) = credentials {
        service.login(username, password).outcome().await?;
    }

    let transport = Arc::new(ReqwestTransport::new()?);
    let body = service
        .execute(BearerRequest::<serde_json::Value>::get(transport, url))
        .await?;
    let pretty = serde_json::to_string_pretty(&body)
        .map_err(|e| format!("SYSTEM_ERROR: failed to format response: {e}"))?;
    println!("{pretty}");
    Ok(())
}
