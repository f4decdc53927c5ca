use chrono::{DateTime, Utc};
use rusqlite::params;

use bluelink_shared::types::MessageStatus;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

impl Database {
    /// Insert a message record. Idempotent: re-inserting the same id
    /// replaces the row instead of duplicating it.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO messages
                 (id, conversation_id, sender_id, receiver_id, content, timestamp, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.conversation_id,
                message.sender_id,
                message.receiver_id,
                message.content,
                message.timestamp.to_rfc3339(),
                message.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Update only the delivery status; content is immutable once stored.
    pub fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_messages_for_conversation(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation_id, sender_id, receiver_id, content, timestamp, status
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp ASC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn get_message_by_id(&self, id: &str) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, conversation_id, sender_id, receiver_id, content, timestamp, status
                 FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let ts_str: String = row.get(5)?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let status_str: String = row.get(6)?;

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        content: row.get(4)?,
        timestamp,
        status: MessageStatus::parse(&status_str),
    })
}
