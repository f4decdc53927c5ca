//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `devices`, `messages` and `files`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Devices (known peers)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS devices (
    id          TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name        TEXT NOT NULL,
    address     TEXT UNIQUE NOT NULL,        -- radio address
    trusted     INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1, user-set
    last_seen   TEXT NOT NULL,               -- ISO-8601 / RFC-3339
    fingerprint TEXT                         -- public-key digest, set after pairing
);

CREATE INDEX IF NOT EXISTS idx_devices_addr ON devices(address);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,              -- sorted peer-pair join
    sender_id       TEXT NOT NULL,
    receiver_id     TEXT NOT NULL,
    content         TEXT NOT NULL,
    timestamp       TEXT NOT NULL,              -- ISO-8601
    status          TEXT NOT NULL DEFAULT 'sent'
        CHECK (status IN ('sent', 'delivered', 'failed'))
);

CREATE INDEX IF NOT EXISTS idx_messages_conv
    ON messages(conversation_id, timestamp);

-- ----------------------------------------------------------------
-- Files (transfer records)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    sender_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    filename    TEXT NOT NULL,
    size        INTEGER NOT NULL,
    checksum    TEXT NOT NULL,                -- hex BLAKE3 of the whole file
    path        TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'in_progress', 'paused',
                          'completed', 'cancelled', 'failed'))
);

CREATE INDEX IF NOT EXISTS idx_files_ts ON files(timestamp DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
