use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A raw record batch as pulled from the upstream API, before validation.
pub type RawBatch = Vec<serde_json::Value>;

/// The three record types handled by the pipeline.
///
/// The set is closed: extractor, transformer and loader dispatch over these
/// tags, and adding a variant means adding one implementation of each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Users,
    Tracks,
    ListenHistory,
}

impl EntityKind {
    /// Path segment of the upstream endpoint serving this entity.
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityKind::Users => "users",
            EntityKind::Tracks => "tracks",
            EntityKind::ListenHistory => "listen_history",
        }
    }

    /// Destination table name.
    pub fn table(&self) -> &'static str {
        // Endpoint and table names happen to coincide upstream.
        self.endpoint()
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// A music track, keyed by the identifier assigned upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    pub name: String,
    pub artist: String,
    /// Free text, may list several songwriters.
    pub songwriters: Option<String>,
    /// Normalized `MM:SS` string.
    pub duration: String,
    /// Comma-separated genre list with the upstream brace wrapping removed.
    pub genres: String,
    pub album: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A listener account, keyed by the identifier assigned upstream.
///
/// Email is the secondary natural key: two records carrying the same email
/// under distinct ids are duplicate data, not separate users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    /// Lowercased during transformation; unique across users.
    pub email: String,
    pub gender: String,
    pub favorite_genres: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// One listening event: a user played a track.
///
/// The row id is assigned by the destination store; the natural identity used
/// for deduplication and idempotent loading is
/// `(user_id, track_id, updated_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenHistory {
    pub user_id: i64,
    pub track_id: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
