//! Device directory.
//!
//! Devices are registered once (seeded from config or created through the
//! CRUD surface) and read back by the capture coordinator when a start
//! request arrives. The core only ever reads; records are immutable for the
//! duration of a capture session.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Connection details for one camera device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    /// Base URL of the device's HTTP endpoint, e.g. `http://10.0.0.12:8080`.
    /// The stream source appends `/stream` and `/ping` to it.
    pub url: String,
}

/// Read-only lookup used by the capture coordinator.
///
/// An unknown identifier is `Ok(None)`; `Err` is reserved for infrastructure
/// failures (the store itself being unreachable or corrupt).
pub trait DeviceDirectory: Send + Sync {
    fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;
}

// -------------------- SQLite store --------------------

/// Device store backed by SQLite.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open device database {}", db_path))?;
        let dir = Self {
            conn: Mutex::new(conn),
        };
        dir.ensure_schema()?;
        Ok(dir)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock_conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS devices (
              device_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              device_url TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_device(&self, record: &DeviceRecord) -> Result<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO devices (device_id, name, device_url, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![record.id, record.name, record.url, crate::now_millis()],
            )
            .with_context(|| format!("create device {}", record.id))?;
        Ok(())
    }

    /// Insert or refresh a device record. Used to seed config-declared
    /// devices at daemon startup.
    pub fn upsert_device(&self, record: &DeviceRecord) -> Result<()> {
        self.lock_conn()
            .execute(
                r#"
                INSERT INTO devices (device_id, name, device_url, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(device_id) DO UPDATE SET name = ?2, device_url = ?3
                "#,
                params![record.id, record.name, record.url, crate::now_millis()],
            )
            .with_context(|| format!("upsert device {}", record.id))?;
        Ok(())
    }

    pub fn update_device(&self, record: &DeviceRecord) -> Result<Option<DeviceRecord>> {
        let updated = self
            .lock_conn()
            .execute(
                "UPDATE devices SET name = ?2, device_url = ?3 WHERE device_id = ?1",
                params![record.id, record.name, record.url],
            )
            .with_context(|| format!("update device {}", record.id))?;
        if updated == 0 {
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT device_id, name, device_url FROM devices ORDER BY device_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(DeviceRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                url: row.get(2)?,
            })
        })?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }
}

impl DeviceDirectory for SqliteDirectory {
    fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let conn = self.lock_conn();
        let record = conn
            .query_row(
                "SELECT device_id, name, device_url FROM devices WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok(DeviceRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        url: row.get(2)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("look up device {}", device_id))?;
        Ok(record)
    }
}

// -------------------- In-memory store --------------------

/// In-memory directory for tests and config-only deployments.
#[derive(Default)]
pub struct MemoryDirectory {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let dir = Self::new();
        for device in devices {
            dir.insert(device);
        }
        dir
    }

    pub fn insert(&self, device: DeviceRecord) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.id.clone(), device);
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned())
    }
}
