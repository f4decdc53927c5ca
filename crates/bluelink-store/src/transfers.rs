use chrono::{DateTime, Utc};
use rusqlite::params;

use bluelink_shared::types::TransferStatus;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::FileTransfer;

impl Database {
    /// Insert or update a transfer record. Idempotent on the transfer id.
    pub fn upsert_transfer(&self, transfer: &FileTransfer) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO files
                 (id, sender_id, receiver_id, filename, size, checksum, path, timestamp, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                transfer.id,
                transfer.sender_id,
                transfer.receiver_id,
                transfer.filename,
                transfer.size,
                transfer.checksum,
                transfer.path,
                transfer.timestamp.to_rfc3339(),
                transfer.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn update_transfer_status(&self, id: &str, status: TransferStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE files SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_transfers(&self) -> Result<Vec<FileTransfer>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, sender_id, receiver_id, filename, size, checksum, path, timestamp, status
             FROM files
             ORDER BY timestamp DESC",
        )?;

        let rows = stmt.query_map([], row_to_transfer)?;

        let mut transfers = Vec::new();
        for row in rows {
            transfers.push(row?);
        }
        Ok(transfers)
    }

    pub fn get_transfer_by_id(&self, id: &str) -> Result<FileTransfer> {
        self.conn()
            .query_row(
                "SELECT id, sender_id, receiver_id, filename, size, checksum, path, timestamp, status
                 FROM files WHERE id = ?1",
                params![id],
                row_to_transfer,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_transfer(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileTransfer> {
    let ts_str: String = row.get(7)?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let status_str: String = row.get(8)?;

    Ok(FileTransfer {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        filename: row.get(3)?,
        size: row.get(4)?,
        checksum: row.get(5)?,
        path: row.get(6)?,
        timestamp,
        status: TransferStatus::parse(&status_str),
    })
}
