//! Persistent account store backed by SQLite.

use crate::error::{StorageError, StorageResult};
use octagon_types::{AccountMetadata, ContainerName, ContextId};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Durable store for per-(container, context) account state.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct AccountStore {
    conn: Arc<Mutex<Connection>>,
}

impl AccountStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory store.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS account_metadata (
                container TEXT NOT NULL,
                context TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (container, context)
            );

            CREATE TABLE IF NOT EXISTS secret_items (
                container TEXT NOT NULL,
                context TEXT NOT NULL,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (container, context, kind)
            );
            ",
        )?;
        Ok(())
    }

    // ── Account metadata ─────────────────────────────────────────

    /// Writes the full record, replacing whatever was stored before.
    pub fn save(
        &self,
        container: &ContainerName,
        context: &ContextId,
        metadata: &AccountMetadata,
    ) -> StorageResult<()> {
        let data = metadata.to_json()?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO account_metadata (container, context, data) VALUES (?1, ?2, ?3)",
            params![container.as_str(), context.as_str(), data],
        )?;
        debug!(%container, %context, "saved account metadata");
        Ok(())
    }

    /// Loads the record for (container, context).
    ///
    /// A missing record is `NotFound`. A record that no longer decodes loads
    /// as `AccountMetadata::default()`.
    pub fn load(
        &self,
        container: &ContainerName,
        context: &ContextId,
    ) -> StorageResult<AccountMetadata> {
        let conn = self.lock()?;
        let data: Option<Result<Vec<u8>, Type>> = conn
            .query_row(
                "SELECT data FROM account_metadata WHERE container = ?1 AND context = ?2",
                params![container.as_str(), context.as_str()],
                |row| {
                    Ok(match row.get_ref(0)? {
                        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Ok(bytes.to_vec()),
                        other => Err(other.data_type()),
                    })
                },
            )
            .optional()?;

        let Some(data) = data else {
            return Err(StorageError::NotFound {
                container: container.to_string(),
                context: context.to_string(),
            });
        };

        match decode_metadata(data) {
            Ok(metadata) => Ok(metadata),
            Err(reason) => {
                warn!(%container, %context, error = %reason, "account metadata is corrupted, using defaults");
                Ok(AccountMetadata::default())
            }
        }
    }

    /// Deletes the record. Returns true if one existed.
    pub fn delete(&self, container: &ContainerName, context: &ContextId) -> StorageResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM account_metadata WHERE container = ?1 AND context = ?2",
            params![container.as_str(), context.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Lists every context with a record in `container`, sorted by name.
    pub fn list_contexts(&self, container: &ContainerName) -> StorageResult<Vec<ContextId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT context FROM account_metadata WHERE container = ?1 ORDER BY context",
        )?;
        let rows = stmt.query_map(params![container.as_str()], |row| row.get::<_, String>(0))?;

        let mut contexts = Vec::new();
        for row in rows {
            contexts.push(ContextId::new(row?));
        }
        Ok(contexts)
    }

    // ── Secret items ─────────────────────────────────────────────

    /// Stores an opaque secret, replacing any previous value of that kind.
    pub fn save_secret(
        &self,
        container: &ContainerName,
        context: &ContextId,
        kind: &str,
        data: &[u8],
    ) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO secret_items (container, context, kind, data) VALUES (?1, ?2, ?3, ?4)",
            params![container.as_str(), context.as_str(), kind, data],
        )?;
        Ok(())
    }

    /// Loads a secret, if present.
    pub fn load_secret(
        &self,
        container: &ContainerName,
        context: &ContextId,
        kind: &str,
    ) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let data = conn
            .query_row(
                "SELECT data FROM secret_items WHERE container = ?1 AND context = ?2 AND kind = ?3",
                params![container.as_str(), context.as_str(), kind],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Removes every secret for (container, context). Returns how many went.
    pub fn delete_secrets(
        &self,
        container: &ContainerName,
        context: &ContextId,
    ) -> StorageResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM secret_items WHERE container = ?1 AND context = ?2",
            params![container.as_str(), context.as_str()],
        )?;
        Ok(removed)
    }
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore").finish_non_exhaustive()
    }
}

/// Decodes a stored `data` cell. Any failure means the row is corrupted.
fn decode_metadata(data: Result<Vec<u8>, Type>) -> Result<AccountMetadata, String> {
    let bytes = data.map_err(|kind| format!("unexpected column type {kind}"))?;
    let text = String::from_utf8(bytes).map_err(|e| e.to_string())?;
    AccountMetadata::from_json(&text).map_err(|e| e.to_string())
}
