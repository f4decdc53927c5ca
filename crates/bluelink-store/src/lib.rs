//! # bluelink-store
//!
//! Durable storage for the BlueLink application, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for peers,
//! messages and file transfers. Writes are idempotent on retry: the same
//! record id replaces rather than duplicates.

pub mod database;
pub mod devices;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod transfers;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
