//! SQLite-backed registry of running service daemons.

use crate::config::RegistryConfig;
use crate::{Result, SoloError};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A registered daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub pid: u32,
    pub port: u16,
    /// Set once the daemon retained itself after an unbind.
    pub discoverable: bool,
    pub registered_at: String,
    pub version: Option<String>,
}

/// Outcome of [`ServiceRegistry::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The slot is ours.
    Claimed,
    /// Another process holds the slot.
    Held(ServiceEntry),
}

/// SQLite-backed registry shared by every daemon on the machine.
///
/// Uses WAL mode for safe concurrent access across processes and
/// `Arc<Mutex<Connection>>` for thread safety within a process.
#[derive(Clone)]
pub struct ServiceRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").finish_non_exhaustive()
    }
}

const ENTRY_COLUMNS: &str = "name, pid, port, discoverable, registered_at, version";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceEntry> {
    Ok(ServiceEntry {
        name: row.get(0)?,
        pid: row.get(1)?,
        port: row.get(2)?,
        discoverable: row.get(3)?,
        registered_at: row.get(4)?,
        version: row.get(5)?,
    })
}

impl ServiceRegistry {
    /// Open the registry at the default platform location.
    pub fn open() -> Result<Self> {
        let db_path = crate::platform::registry_db_path()?;
        Self::open_at(&db_path)
    }

    /// Open the registry at a specific path.
    ///
    /// Creates the database and parent directories if they don't exist.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| SoloError::Io {
                    message: format!(
                        "Failed to create registry directory: {}",
                        parent.display()
                    ),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout={};\n\
             PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=NORMAL;",
            RegistryConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS services (
                name TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                port INTEGER NOT NULL,
                discoverable INTEGER NOT NULL DEFAULT 0,
                registered_at TEXT NOT NULL,
                version TEXT
            );",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SoloError::Database {
            message: "Failed to acquire registry connection lock".to_string(),
            source: None,
        })
    }

    /// Atomically take the slot for `name` unless another process holds it.
    ///
    /// Runs in an `IMMEDIATE` transaction so two processes racing on the same
    /// name serialize on the database write lock: exactly one sees the slot
    /// empty. Re-claiming our own slot refreshes the port.
    pub fn claim(&self, name: &str, pid: u32, port: u16) -> Result<Claim> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM services WHERE name = ?1"),
                params![name],
                entry_from_row,
            )
            .optional()?;

        if let Some(entry) = existing {
            if entry.pid != pid {
                tx.commit()?;
                debug!("Slot {} held by PID {} on port {}", name, entry.pid, entry.port);
                return Ok(Claim::Held(entry));
            }
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO services (name, pid, port, discoverable, registered_at, version)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 port=excluded.port,
                 registered_at=excluded.registered_at",
            params![name, pid, port, now, env!("CARGO_PKG_VERSION")],
        )?;
        tx.commit()?;

        debug!("Claimed slot {}: PID {} on port {}", name, pid, port);
        Ok(Claim::Claimed)
    }

    /// Register a daemon as directly discoverable. Upserts the slot.
    pub fn register(&self, name: &str, pid: u32, port: u16) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO services (name, pid, port, discoverable, registered_at, version)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 pid=excluded.pid,
                 port=excluded.port,
                 discoverable=1,
                 registered_at=excluded.registered_at,
                 version=excluded.version",
            params![name, pid, port, now, env!("CARGO_PKG_VERSION")],
        )?;

        debug!("Registered {} as discoverable: PID {} on port {}", name, pid, port);
        Ok(())
    }

    /// Look up whoever holds the slot for `name`.
    pub fn lookup(&self, name: &str) -> Result<Option<ServiceEntry>> {
        let conn = self.lock_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM services WHERE name = ?1"),
                params![name],
                entry_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Look up a daemon that registered itself as discoverable.
    pub fn lookup_discoverable(&self, name: &str) -> Result<Option<ServiceEntry>> {
        Ok(self.lookup(name)?.filter(|entry| entry.discoverable))
    }

    /// Delete exactly this entry, if it is still the one in the slot.
    ///
    /// Used after an arbitration call to the holder failed: the row points
    /// at a dead endpoint. A different row (someone re-claimed meanwhile) is
    /// left alone.
    pub fn release_stale(&self, entry: &ServiceEntry) -> Result<bool> {
        let conn = self.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM services WHERE name = ?1 AND pid = ?2 AND port = ?3",
            params![entry.name, entry.pid, entry.port],
        )?;
        if rows > 0 {
            debug!("Released stale slot {} (PID {})", entry.name, entry.pid);
        }
        Ok(rows > 0)
    }

    /// Remove the slot for `name` if it belongs to `pid`.
    pub fn unregister(&self, name: &str, pid: u32) -> Result<bool> {
        let conn = self.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM services WHERE name = ?1 AND pid = ?2",
            params![name, pid],
        )?;
        if rows > 0 {
            debug!("Unregistered {} (PID {})", name, pid);
        }
        Ok(rows > 0)
    }

    /// List all registered services.
    pub fn list(&self) -> Result<Vec<ServiceEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM services ORDER BY name"
        ))?;
        let rows = stmt.query_map([], entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Remove entries whose PID is no longer alive.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let entries = self.list()?;
        let conn = self.lock_conn()?;

        let mut removed = 0;
        for entry in entries
            .iter()
            .filter(|entry| !crate::platform::is_process_alive(entry.pid))
        {
            removed += conn.execute(
                "DELETE FROM services WHERE name = ?1 AND pid = ?2",
                params![entry.name, entry.pid],
            )?;
            debug!("Cleaned up stale service {}: PID {} (dead)", entry.name, entry.pid);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_registry() -> (ServiceRegistry, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test-registry.db");
        let registry = ServiceRegistry::open_at(&db_path).unwrap();
        (registry, temp_dir)
    }

    #[test]
    fn test_claim_empty_slot() {
        let (registry, _temp_dir) = create_test_registry();

        let claim = registry.claim("soloipc:app/.Svc", 100, 4000).unwrap();
        assert_eq!(claim, Claim::Claimed);

        let entry = registry.lookup("soloipc:app/.Svc").unwrap().unwrap();
        assert_eq!(entry.pid, 100);
        assert_eq!(entry.port, 4000);
        assert!(!entry.discoverable);
    }

    #[test]
    fn test_claim_held_by_other_pid() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("svc", 100, 4000).unwrap();
        let claim = registry.claim("svc", 200, 5000).unwrap();

        match claim {
            Claim::Held(entry) => {
                assert_eq!(entry.pid, 100);
                assert_eq!(entry.port, 4000);
            }
            Claim::Claimed => panic!("second claimant must not win"),
        }
    }

    #[test]
    fn test_reclaim_own_slot_refreshes_port() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("svc", 100, 4000).unwrap();
        assert_eq!(registry.claim("svc", 100, 4001).unwrap(), Claim::Claimed);

        assert_eq!(registry.lookup("svc").unwrap().unwrap().port, 4001);
    }

    #[test]
    fn test_register_marks_discoverable() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("svc", 100, 4000).unwrap();
        assert!(registry.lookup_discoverable("svc").unwrap().is_none());

        registry.register("svc", 100, 4000).unwrap();
        let entry = registry.lookup_discoverable("svc").unwrap().unwrap();
        assert!(entry.discoverable);
        assert_eq!(entry.pid, 100);
    }

    #[test]
    fn test_register_overwrites_stale_holder() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("svc", 100, 4000).unwrap();
        registry.register("svc", 200, 5000).unwrap();

        let entry = registry.lookup("svc").unwrap().unwrap();
        assert_eq!(entry.pid, 200);
        assert_eq!(entry.port, 5000);
    }

    #[test]
    fn test_release_stale_only_matching_row() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("svc", 100, 4000).unwrap();
        let stale = registry.lookup("svc").unwrap().unwrap();

        // Someone else re-claimed meanwhile: releasing the old view is a no-op.
        registry.unregister("svc", 100).unwrap();
        registry.claim("svc", 300, 6000).unwrap();
        assert!(!registry.release_stale(&stale).unwrap());
        assert_eq!(registry.lookup("svc").unwrap().unwrap().pid, 300);

        let current = registry.lookup("svc").unwrap().unwrap();
        assert!(registry.release_stale(&current).unwrap());
        assert!(registry.lookup("svc").unwrap().is_none());
    }

    #[test]
    fn test_unregister_requires_owner_pid() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("svc", 100, 4000).unwrap();
        assert!(!registry.unregister("svc", 999).unwrap());
        assert!(registry.unregister("svc", 100).unwrap());
        assert!(registry.lookup("svc").unwrap().is_none());
    }

    #[test]
    fn test_list_sorted_by_name() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("b-svc", 1, 1).unwrap();
        registry.claim("a-svc", 2, 2).unwrap();

        let names: Vec<_> = registry.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a-svc", "b-svc"]);
    }

    #[test]
    fn test_cleanup_stale_removes_dead_pid() {
        let (registry, _temp_dir) = create_test_registry();

        registry.claim("dead", 999_999_999, 1).unwrap();
        registry.claim("alive", std::process::id(), 2).unwrap();

        let removed = registry.cleanup_stale().unwrap();
        assert_eq!(removed, 1);
        assert!(registry.lookup("dead").unwrap().is_none());
        assert!(registry.lookup("alive").unwrap().is_some());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("shared-registry.db");
        // Make sure the schema exists before the race starts.
        ServiceRegistry::open_at(&db_path).unwrap();

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let db_path = db_path.clone();
                std::thread::spawn(move || {
                    let registry = ServiceRegistry::open_at(&db_path).unwrap();
                    registry.claim("raced", 1000 + i, 7000 + i as u16).unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|claim| *claim == Claim::Claimed)
            .count();
        assert_eq!(winners, 1);
    }
}
