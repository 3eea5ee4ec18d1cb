//! Usage: Persisted credential storage (SQLite-backed and in-memory implementations).

use crate::domain::grant::AccessGrant;
use crate::shared::error::{db_err, AppResult};
use crate::shared::mutex_ext::MutexExt;
use crate::shared::time::now_unix_seconds;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_GRANT_KEY: &str = "default";
const BUSY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Load/save seam for the current grant. Implement this to plug in custom persistence.
pub trait CredentialStorage: Send + Sync {
    /// Returns `None` when nothing has been persisted yet.
    fn load(&self) -> AppResult<Option<AccessGrant>>;

    fn save(&self, grant: &AccessGrant) -> AppResult<()>;
}

/// Keeps the grant in process memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStorage {
    grant: Mutex<Option<AccessGrant>>,
}

impl MemoryCredentialStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grant(grant: AccessGrant) -> Self {
        Self {
            grant: Mutex::new(Some(grant)),
        }
    }
}

impl CredentialStorage for MemoryCredentialStorage {
    fn load(&self) -> AppResult<Option<AccessGrant>> {
        Ok(self.grant.lock_or_recover().clone())
    }

    fn save(&self, grant: &AccessGrant) -> AppResult<()> {
        *self.grant.lock_or_recover() = Some(grant.clone());
        Ok(())
    }
}

/// Stores grants in a single SQLite table keyed by name.
#[derive(Debug)]
pub struct SqliteCredentialStorage {
    conn: Mutex<Connection>,
    key: String,
}

impl SqliteCredentialStorage {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("SYSTEM_ERROR: failed to create credential db dir: {e}"))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| db_err!("failed to open credential db {}: {e}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_err!("failed to open in-memory credential db: {e}"))?;
        Self::from_connection(conn)
    }

    /// Use a different row key, e.g. one per account.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        let key = key.trim();
        if !key.is_empty() {
            self.key = key.to_string();
        }
        self
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| db_err!("failed to set busy_timeout: {e}"))?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: DEFAULT_GRANT_KEY.to_string(),
        })
    }
}

fn ensure_schema(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS access_grants (
  grant_key TEXT PRIMARY KEY NOT NULL,
  access_token TEXT NOT NULL DEFAULT '',
  scope TEXT NOT NULL DEFAULT '',
  refresh_token TEXT NOT NULL DEFAULT '',
  expires_at INTEGER NOT NULL DEFAULT 0,
  updated_at INTEGER NOT NULL
);
"#,
    )
    .map_err(|e| db_err!("failed to ensure access_grants schema: {e}"))
}

impl CredentialStorage for SqliteCredentialStorage {
    fn load(&self) -> AppResult<Option<AccessGrant>> {
        let conn = self.conn.lock_or_recover();
        conn.query_row(
            r#"
SELECT
  COALESCE(access_token, ''),
  COALESCE(scope, ''),
  COALESCE(refresh_token, ''),
  COALESCE(expires_at, 0)
FROM access_grants
WHERE grant_key = ?1
"#,
            params![self.key],
            |row| {
                Ok(AccessGrant::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    Some(row.get::<_, i64>(3)?),
                ))
            },
        )
        .optional()
        .map_err(|e| db_err!("failed to load access grant: {e}"))
    }

    fn save(&self, grant: &AccessGrant) -> AppResult<()> {
        let conn = self.conn.lock_or_recover();
        conn.execute(
            r#"
INSERT INTO access_grants (grant_key, access_token, scope, refresh_token, expires_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(grant_key) DO UPDATE SET
  access_token = excluded.access_token,
  scope = excluded.scope,
  refresh_token = excluded.refresh_token,
  expires_at = excluded.expires_at,
  updated_at = excluded.updated_at
"#,
            params![
                self.key,
                grant.access_token(),
                grant.scope(),
                grant.refresh_token(),
                grant.expires_at().unwrap_or(0),
                now_unix_seconds(),
            ],
        )
        .map_err(|e| db_err!("failed to save access grant: {e}"))?;
        Ok(())
    }
}
