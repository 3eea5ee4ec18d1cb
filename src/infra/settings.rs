//! Usage: Persisted service settings (schema + read/write helpers).

use crate::dispatch::retry::RetrySettings;
use crate::shared::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_WORKER_COUNT: u32 = 4;
pub const DEFAULT_REFRESH_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_RETRIES_AFTER_REFRESH: u32 = 1;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 0;
const MAX_WORKER_COUNT: u32 = 64;
const MAX_REFRESH_RETRY_BUDGET: u32 = 10;
const MAX_RETRY_DELAY_MS: u64 = 60_000;

const ENV_WORKER_COUNT: &str = "OAUTH_RELAY_WORKER_COUNT";
const ENV_REFRESH_RETRY_BUDGET: &str = "OAUTH_RELAY_REFRESH_RETRY_BUDGET";
const ENV_RETRIES_AFTER_REFRESH: &str = "OAUTH_RELAY_RETRIES_AFTER_REFRESH";
const ENV_RETRY_DELAY_MS: &str = "OAUTH_RELAY_RETRY_DELAY_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub schema_version: u32,
    // Max concurrent network attempts in the execution service.
    pub worker_count: u32,
    // 401 retries allowed per request before it is abandoned.
    pub refresh_retry_budget: u32,
    // Remaining attempts granted to a request once its refresh succeeded.
    pub retries_after_refresh: u32,
    pub retry_delay_ms: u64,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scope: String,
    // SQLite file for the persisted grant; memory storage when absent.
    pub credential_db_path: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            worker_count: DEFAULT_WORKER_COUNT,
            refresh_retry_budget: DEFAULT_REFRESH_RETRY_BUDGET,
            retries_after_refresh: DEFAULT_RETRIES_AFTER_REFRESH,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            token_uri: String::new(),
            client_id: String::new(),
            client_secret: None,
            scope: String::new(),
            credential_db_path: None,
        }
    }
}

impl ServiceSettings {
    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            refresh_retry_budget: self.refresh_retry_budget.max(1),
            retries_after_refresh: self
                .retries_after_refresh
                .clamp(1, self.refresh_retry_budget.max(1)),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn apply_env_overrides(&mut self) -> bool {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    fn apply_env_overrides_from(&mut self, mut get: impl FnMut(&str) -> Option<String>) -> bool {
        let mut changed = false;
        if let Some(v) = get(ENV_WORKER_COUNT).as_deref().and_then(parse_u64_trimmed) {
            self.worker_count = v.min(u32::MAX as u64) as u32;
            changed = true;
        }
        if let Some(v) = get(ENV_REFRESH_RETRY_BUDGET)
            .as_deref()
            .and_then(parse_u64_trimmed)
        {
            self.refresh_retry_budget = v.min(u32::MAX as u64) as u32;
            changed = true;
        }
        if let Some(v) = get(ENV_RETRIES_AFTER_REFRESH)
            .as_deref()
            .and_then(parse_u64_trimmed)
        {
            self.retries_after_refresh = v.min(u32::MAX as u64) as u32;
            changed = true;
        }
        if let Some(v) = get(ENV_RETRY_DELAY_MS).as_deref().and_then(parse_u64_trimmed) {
            self.retry_delay_ms = v;
            changed = true;
        }
        if changed {
            sanitize_retry_settings(self);
            sanitize_worker_count(self);
        }
        changed
    }
}

fn parse_u64_trimmed(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok()
}

fn sanitize_worker_count(settings: &mut ServiceSettings) -> bool {
    let sanitized = match settings.worker_count {
        0 => DEFAULT_WORKER_COUNT,
        v => v.min(MAX_WORKER_COUNT),
    };
    let changed = sanitized != settings.worker_count;
    settings.worker_count = sanitized;
    changed
}

fn sanitize_retry_settings(settings: &mut ServiceSettings) -> bool {
    let mut changed = false;

    let budget = match settings.refresh_retry_budget {
        0 => DEFAULT_REFRESH_RETRY_BUDGET,
        v => v.min(MAX_REFRESH_RETRY_BUDGET),
    };
    if budget != settings.refresh_retry_budget {
        settings.refresh_retry_budget = budget;
        changed = true;
    }

    let after = settings.retries_after_refresh.clamp(1, budget);
    if after != settings.retries_after_refresh {
        settings.retries_after_refresh = after;
        changed = true;
    }

    let delay = settings.retry_delay_ms.min(MAX_RETRY_DELAY_MS);
    if delay != settings.retry_delay_ms {
        settings.retry_delay_ms = delay;
        changed = true;
    }

    changed
}

fn sanitize_oauth_client_fields(settings: &mut ServiceSettings) -> bool {
    let mut changed = false;
    for field in [
        &mut settings.token_uri,
        &mut settings.client_id,
        &mut settings.scope,
    ] {
        let trimmed = field.trim();
        if trimmed.len() != field.len() {
            *field = trimmed.to_string();
            changed = true;
        }
    }
    if let Some(secret) = settings.client_secret.as_deref() {
        if secret.trim().is_empty() {
            settings.client_secret = None;
            changed = true;
        }
    }
    changed
}

fn migrate_bump_schema_version(
    settings: &mut ServiceSettings,
    schema_version_present: bool,
    target: u32,
) -> bool {
    if schema_version_present && settings.schema_version >= target {
        return false;
    }
    settings.schema_version = settings.schema_version.max(target);
    true
}

fn parse_settings_json(content: &str) -> AppResult<(ServiceSettings, bool)> {
    let raw: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| format!("SEC_INVALID_INPUT: failed to parse settings.json: {e}"))?;
    let schema_version_present = raw.get("schema_version").is_some();
    let settings: ServiceSettings = serde_json::from_value(raw)
        .map_err(|e| format!("SEC_INVALID_INPUT: failed to parse settings.json: {e}"))?;
    Ok((settings, schema_version_present))
}

/// Reads settings from `path`; a missing file yields defaults (and is created best-effort).
pub fn read(path: &Path) -> AppResult<ServiceSettings> {
    if !path.exists() {
        let settings = ServiceSettings::default();
        if let Err(err) = write(path, &settings) {
            tracing::debug!("settings file not created: {}", err);
        }
        return Ok(settings);
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("SYSTEM_ERROR: failed to read settings: {e}"))?;
    let (mut settings, schema_version_present) = parse_settings_json(&content)?;

    let mut repaired = false;
    repaired |= migrate_bump_schema_version(&mut settings, schema_version_present, SCHEMA_VERSION);
    repaired |= sanitize_worker_count(&mut settings);
    repaired |= sanitize_retry_settings(&mut settings);
    repaired |= sanitize_oauth_client_fields(&mut settings);
    if repaired {
        tracing::warn!(path = %path.display(), "settings repaired on read");
        // Best-effort: persist repaired values while keeping read semantics.
        let _ = write(path, &settings);
    }

    Ok(settings)
}

pub fn write(path: &Path, settings: &ServiceSettings) -> AppResult<ServiceSettings> {
    if settings.worker_count == 0 || settings.worker_count > MAX_WORKER_COUNT {
        return Err(format!(
            "SEC_INVALID_INPUT: worker_count must be between 1 and {MAX_WORKER_COUNT}"
        )
        .into());
    }
    if settings.refresh_retry_budget == 0 || settings.refresh_retry_budget > MAX_REFRESH_RETRY_BUDGET
    {
        return Err(format!(
            "SEC_INVALID_INPUT: refresh_retry_budget must be between 1 and {MAX_REFRESH_RETRY_BUDGET}"
        )
        .into());
    }
    if settings.retries_after_refresh == 0
        || settings.retries_after_refresh > settings.refresh_retry_budget
    {
        return Err(
            "SEC_INVALID_INPUT: retries_after_refresh must be between 1 and refresh_retry_budget"
                .into(),
        );
    }
    if settings.retry_delay_ms > MAX_RETRY_DELAY_MS {
        return Err(
            format!("SEC_INVALID_INPUT: retry_delay_ms must be <= {MAX_RETRY_DELAY_MS}").into(),
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("SYSTEM_ERROR: failed to create settings dir: {e}"))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let backup_path = path.with_extension("json.bak");

    let content = serde_json::to_vec_pretty(settings)
        .map_err(|e| format!("SYSTEM_ERROR: failed to serialize settings: {e}"))?;

    std::fs::write(&tmp_path, content)
        .map_err(|e| format!("SYSTEM_ERROR: failed to write temp settings file: {e}"))?;

    if backup_path.exists() {
        let _ = std::fs::remove_file(&backup_path);
    }

    if path.exists() {
        std::fs::rename(path, &backup_path)
            .map_err(|e| format!("SYSTEM_ERROR: failed to create settings backup: {e}"))?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::rename(&backup_path, path);
        return Err(format!("SYSTEM_ERROR: failed to finalize settings: {e}").into());
    }

    if backup_path.exists() {
        let _ = std::fs::remove_file(&backup_path);
    }

    Ok(settings.clone())
}
