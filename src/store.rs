// src/store.rs

//! Installation receipt store
//!
//! Durable mapping from package name to its installation receipt, backed by
//! SQLite. Receipts make re-installs of satisfied dependencies a no-op and
//! carry the file list needed for uninstall. Recording is an upsert: a second
//! receipt for the same name replaces the first (upgrade semantics), never
//! duplicates. Writes are serialized behind a single connection lock.

use crate::error::{Error, Result};
use crate::formula::VersionSpec;
use crate::resolver::InstalledQuery;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Current schema version
const SCHEMA_VERSION: i32 = 2;

/// Persistent record of one completed installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub name: String,
    pub version_spec: String,
    pub installed_paths: Vec<String>,
    pub build_options: Vec<String>,
    pub installed_at: String,
}

impl Receipt {
    pub fn new(name: String, version: &VersionSpec, installed_paths: Vec<String>) -> Self {
        Self {
            name,
            version_spec: version.to_string(),
            installed_paths,
            build_options: Vec::new(),
            installed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_build_options(mut self, options: Vec<String>) -> Self {
        self.build_options = options;
        self
    }

    fn from_row(row: &Row) -> rusqlite::Result<(String, String, String, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }
}

/// SQLite-backed receipt store
pub struct ReceiptStore {
    conn: Mutex<Connection>,
}

impl ReceiptStore {
    /// Open (creating if needed) a receipt store at the given path
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        debug!("Opening receipt store at {}", db_path.display());
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a receipt; replaces any prior receipt for the same name
    pub fn record(&self, receipt: &Receipt) -> Result<()> {
        let paths_json = serde_json::to_string(&receipt.installed_paths)
            .map_err(|e| Error::ReceiptCorrupt {
                name: receipt.name.clone(),
                reason: e.to_string(),
            })?;
        let options_json = serde_json::to_string(&receipt.build_options)
            .map_err(|e| Error::ReceiptCorrupt {
                name: receipt.name.clone(),
                reason: e.to_string(),
            })?;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO receipts (name, version_spec, installed_paths, build_options, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                version_spec = excluded.version_spec,
                installed_paths = excluded.installed_paths,
                build_options = excluded.build_options,
                installed_at = excluded.installed_at",
            params![
                &receipt.name,
                &receipt.version_spec,
                &paths_json,
                &options_json,
                &receipt.installed_at,
            ],
        )?;

        info!("Recorded receipt for {} {}", receipt.name, receipt.version_spec);
        Ok(())
    }

    /// Look up the receipt for a name
    pub fn lookup(&self, name: &str) -> Result<Option<Receipt>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .prepare(
                "SELECT name, version_spec, installed_paths, build_options, installed_at
                 FROM receipts WHERE name = ?1",
            )?
            .query_row([name], Receipt::from_row)
            .optional()?;

        match row {
            None => Ok(None),
            Some((name, version_spec, paths_json, options_json, installed_at)) => {
                let installed_paths: Vec<String> = serde_json::from_str(&paths_json)
                    .map_err(|e| Error::ReceiptCorrupt {
                        name: name.clone(),
                        reason: format!("installed_paths: {}", e),
                    })?;
                let build_options: Vec<String> = serde_json::from_str(&options_json)
                    .map_err(|e| Error::ReceiptCorrupt {
                        name: name.clone(),
                        reason: format!("build_options: {}", e),
                    })?;

                Ok(Some(Receipt {
                    name,
                    version_spec,
                    installed_paths,
                    build_options,
                    installed_at,
                }))
            }
        }
    }

    /// Remove the receipt for a name; absent names are a no-op
    pub fn remove(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM receipts WHERE name = ?1", [name])?;
        Ok(())
    }

    /// All receipts, ordered by name
    pub fn list(&self) -> Result<Vec<Receipt>> {
        let names: Vec<String> = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn.prepare("SELECT name FROM receipts ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut receipts = Vec::with_capacity(names.len());
        for name in names {
            if let Some(receipt) = self.lookup(&name)? {
                receipts.push(receipt);
            }
        }
        Ok(receipts)
    }
}

impl InstalledQuery for ReceiptStore {
    fn is_satisfied(&self, name: &str, version: &VersionSpec) -> Result<bool> {
        Ok(self
            .lookup(name)?
            .is_some_and(|r| r.version_spec == version.to_string()))
    }
}

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;
    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    Ok(version)
}

/// Apply pending migrations
fn migrate(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        debug!("Applying receipt store migration to version {}", version);
        match version {
            1 => migrate_v1(conn)?,
            2 => migrate_v2(conn)?,
            _ => unreachable!("unknown migration version {}", version),
        }
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }

    Ok(())
}

/// Initial schema: the receipts table
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE receipts (
            name TEXT PRIMARY KEY,
            version_spec TEXT NOT NULL,
            installed_paths TEXT NOT NULL,
            installed_at TEXT NOT NULL
        );

        CREATE INDEX idx_receipts_installed_at ON receipts(installed_at);
        ",
    )?;
    Ok(())
}

/// Version 2: record the build options an install was configured with
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        ALTER TABLE receipts ADD COLUMN build_options TEXT NOT NULL DEFAULT '[]';
        ",
    )?;
    Ok(())
}
