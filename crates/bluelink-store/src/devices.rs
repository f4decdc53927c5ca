use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Device;

impl Database {
    /// Insert or update a device record, keyed on its unique radio address.
    ///
    /// Re-discovery refreshes the name, last-seen timestamp and fingerprint
    /// but never clobbers the user-set trust flag or the original id.
    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        self.conn().execute(
            "INSERT INTO devices (id, name, address, trusted, last_seen, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(address) DO UPDATE SET
                 name = excluded.name,
                 last_seen = excluded.last_seen,
                 fingerprint = COALESCE(excluded.fingerprint, devices.fingerprint)",
            params![
                device.id,
                device.name,
                device.address,
                device.trusted,
                device.last_seen.to_rfc3339(),
                device.fingerprint,
            ],
        )?;
        Ok(())
    }

    /// Flip the user-set trust flag.
    pub fn set_device_trusted(&self, id: &str, trusted: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE devices SET trusted = ?1 WHERE id = ?2",
            params![trusted, id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_devices(&self) -> Result<Vec<Device>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, address, trusted, last_seen, fingerprint
             FROM devices
             ORDER BY last_seen DESC",
        )?;

        let rows = stmt.query_map([], row_to_device)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    pub fn get_device_by_address(&self, address: &str) -> Result<Device> {
        self.conn()
            .query_row(
                "SELECT id, name, address, trusted, last_seen, fingerprint
                 FROM devices WHERE address = ?1",
                params![address],
                row_to_device,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn delete_device(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let ts_str: String = row.get(4)?;
    let last_seen: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        trusted: row.get(3)?,
        last_seen,
        fingerprint: row.get(5)?,
    })
}
