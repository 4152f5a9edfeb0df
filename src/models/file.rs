//! Records owned by the file catalog: finished files and their folders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A durable file created by finalizing an upload session.
///
/// The record references the assembled object by `storage_location`; it
/// stores metadata only, never the payload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    pub id: String,

    pub owner_id: String,

    /// Destination folder, if one was chosen at init.
    pub folder_id: Option<String>,

    pub name: String,

    pub mime_type: String,

    pub size_bytes: i64,

    /// Where the append store placed the sealed object.
    pub storage_location: String,

    /// Session this file was finalized from. Unique, so a file can be
    /// looked up after its session row is gone.
    pub upload_session_id: String,

    pub created_at: DateTime<Utc>,
}

/// A destination folder a principal can upload into.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Folder {
    pub id: String,

    pub owner_id: String,

    pub name: String,

    pub created_at: DateTime<Utc>,
}
