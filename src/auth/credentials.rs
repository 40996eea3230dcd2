// Credential storage
// In-memory copy of the credential pair backed by durable key-value storage

use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use super::types::CredentialPair;

/// Storage key for the access credential
pub const ACCESS_TOKEN_KEY: &str = "session:access_token";

/// Storage key for the renewal credential
pub const REFRESH_TOKEN_KEY: &str = "session:refresh_token";

/// Durable persistence for the credential pair
pub trait CredentialBackend: Send + Sync {
    fn load(&self) -> Result<Option<CredentialPair>>;
    fn save(&self, pair: &CredentialPair) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Non-durable backend for tests and throwaway sessions
#[derive(Default)]
pub struct MemoryBackend {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialBackend for MemoryBackend {
    fn load(&self) -> Result<Option<CredentialPair>> {
        Ok(self
            .pair
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        *self.pair.lock().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.pair.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// SQLite backend: two independent keys in an `auth_kv` table
pub struct SqliteBackend {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }

        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get(conn: &rusqlite::Connection, key: &str) -> Result<Option<String>> {
        conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("Failed to read {} from SQLite", key))
    }
}

impl CredentialBackend for SqliteBackend {
    fn load(&self) -> Result<Option<CredentialPair>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        // The access key alone decides whether a session exists
        let Some(access_token) = Self::get(&conn, ACCESS_TOKEN_KEY)? else {
            return Ok(None);
        };
        let refresh_token = Self::get(&conn, REFRESH_TOKEN_KEY)?.unwrap_or_default();

        Ok(Some(CredentialPair {
            access_token,
            refresh_token,
        }))
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction().context("Failed to begin transaction")?;
        for (key, value) in [
            (ACCESS_TOKEN_KEY, &pair.access_token),
            (REFRESH_TOKEN_KEY, &pair.refresh_token),
        ] {
            tx.execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
                [key, value.as_str()],
            )
            .with_context(|| format!("Failed to write {} to SQLite", key))?;
        }
        tx.commit().context("Failed to commit credentials")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "DELETE FROM auth_kv WHERE key IN (?1, ?2)",
            [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY],
        )
        .context("Failed to delete credentials from SQLite")?;
        Ok(())
    }
}

/// The single owner of the current credential pair.
///
/// Reads are served from memory and never touch the backend. Writes swap the
/// in-memory pair first and then persist; persistence failures are logged and
/// the in-memory copy stays authoritative for the life of the process.
pub struct CredentialStore {
    current: RwLock<Option<CredentialPair>>,

    /// Serializes flushes so disk ends up matching the latest in-memory pair
    persist: Mutex<()>,

    backend: Box<dyn CredentialBackend>,
}

impl CredentialStore {
    /// Create a store, loading any previously persisted pair
    pub fn open(backend: Box<dyn CredentialBackend>) -> Result<Self> {
        let current = backend
            .load()
            .context("Failed to load persisted credentials")?;

        match current {
            Some(_) => tracing::info!("Restored persisted session"),
            None => tracing::debug!("No persisted session found"),
        }

        Ok(Self {
            current: RwLock::new(current),
            persist: Mutex::new(()),
            backend,
        })
    }

    /// Empty, non-durable store
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(None),
            persist: Mutex::new(()),
            backend: Box::new(MemoryBackend::new()),
        }
    }

    pub fn read(&self) -> Option<CredentialPair> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    pub fn write(&self, pair: CredentialPair) {
        self.replace(Some(pair));
        self.flush();
    }

    pub fn clear(&self) {
        if self.replace(None).is_some() {
            tracing::debug!("Credentials cleared");
        }
        self.flush();
    }

    /// Swap the in-memory pair without touching the backend.
    ///
    /// Safe to call under other locks; the caller follows up with [`flush`]
    /// once those are released.
    ///
    /// [`flush`]: CredentialStore::flush
    pub(crate) fn replace(&self, pair: Option<CredentialPair>) -> Option<CredentialPair> {
        std::mem::replace(
            &mut *self.current.write().unwrap_or_else(PoisonError::into_inner),
            pair,
        )
    }

    /// Bring the backend in line with the in-memory pair.
    ///
    /// Persists whatever is current when the persist lock is taken, so the
    /// last flush always leaves disk matching memory.
    pub(crate) fn flush(&self) {
        let _guard = self.persist.lock().unwrap_or_else(PoisonError::into_inner);

        let result = match self.read() {
            Some(pair) => self.backend.save(&pair),
            None => self.backend.clear(),
        };

        if let Err(e) = result {
            tracing::warn!(error = ?e, "Failed to persist credentials");
        }
    }
}
