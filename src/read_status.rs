//! Durable per-subject read/unread markers.
//!
//! Keys are record identities as produced by the cache's change detector,
//! scoped by resource, so "unread" means "identity not marked read in this
//! resource for this subject". Identities are only unique within a resource.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

/// Trait for read-status storage backends.
pub trait ReadStatusStore: Send + Sync {
  /// All identities the subject has marked read in `resource`.
  fn read_identities(&self, subject: &str, resource: &str) -> Result<HashSet<String>>;

  /// Mark identities in `resource` as read.
  fn mark_read(&self, subject: &str, resource: &str, identities: &[String]) -> Result<()>;

  /// Mark one identity in `resource` as unread again.
  fn mark_unread(&self, subject: &str, resource: &str, identity: &str) -> Result<()>;
}

/// Storage implementation that remembers nothing.
/// Every record is always unread.
pub struct NoopReadStatus;

impl ReadStatusStore for NoopReadStatus {
  fn read_identities(&self, _subject: &str, _resource: &str) -> Result<HashSet<String>> {
    Ok(HashSet::new())
  }

  fn mark_read(&self, _subject: &str, _resource: &str, _identities: &[String]) -> Result<()> {
    Ok(())
  }

  fn mark_unread(&self, _subject: &str, _resource: &str, _identity: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based read-status storage.
pub struct SqliteReadStatus {
  conn: Mutex<Connection>,
}

/// Schema for read-status tables.
const READ_STATUS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS read_status (
    subject TEXT NOT NULL,
    resource TEXT NOT NULL,
    identity TEXT NOT NULL,
    read_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (subject, resource, identity)
);
"#;

impl SqliteReadStatus {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open read-status database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(READ_STATUS_SCHEMA)
      .map_err(|e| eyre!("Failed to run read-status migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("taskdash").join("read_status.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl ReadStatusStore for SqliteReadStatus {
  fn read_identities(&self, subject: &str, resource: &str) -> Result<HashSet<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT identity FROM read_status WHERE subject = ? AND resource = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let identities = stmt
      .query_map(params![subject, resource], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query read status: {}", e))?
      .collect::<rusqlite::Result<HashSet<String>>>()
      .map_err(|e| eyre!("Failed to read identity: {}", e))?;

    Ok(identities)
  }

  fn mark_read(&self, subject: &str, resource: &str, identities: &[String]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for identity in identities {
      tx.execute(
        "INSERT OR IGNORE INTO read_status (subject, resource, identity, read_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![subject, resource, identity],
      )
      .map_err(|e| eyre!("Failed to mark {} read: {}", identity, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn mark_unread(&self, subject: &str, resource: &str, identity: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "DELETE FROM read_status WHERE subject = ? AND resource = ? AND identity = ?",
        params![subject, resource, identity],
      )
      .map_err(|e| eyre!("Failed to mark {} unread: {}", identity, e))?;
    Ok(())
  }
}
