//! Destination store.
//!
//! [`DestinationStore`] is the row-level persistence seam consumed by the
//! loaders: natural-key upserts for users and tracks, existence checks, and
//! insert-if-absent for listen history. Every call is its own transaction,
//! which is what permits partial-batch success at load time. [`SqliteStore`]
//! is the bundled-SQLite implementation; tests run it in memory.

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::model::{EntityKind, ListenHistory, Track, User};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("persistence failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Row-level write and lookup interface of the relational destination.
///
/// The only mutable shared resource in a pipeline run; loaders are its only
/// writers.
pub trait DestinationStore: Send + Sync {
    /// Insert-or-update keyed by the upstream identifier. Idempotent.
    fn upsert_user(&self, user: &User) -> Result<(), StoreError>;

    /// Insert-or-update keyed by the upstream identifier. Idempotent.
    fn upsert_track(&self, track: &Track) -> Result<(), StoreError>;

    fn user_exists(&self, id: i64) -> Result<bool, StoreError>;

    fn track_exists(&self, id: i64) -> Result<bool, StoreError>;

    /// Inserts a listening row unless one with the same natural identity
    /// `(user_id, track_id, updated_at)` already exists. Returns the new row
    /// id, or `None` when the row was already present.
    fn insert_listen(&self, row: &ListenHistory) -> Result<Option<i64>, StoreError>;

    /// Snapshot of persisted user emails keyed to their ids, taken by the
    /// coordinator before the users transform stage.
    fn user_emails(&self) -> Result<HashMap<String, i64>, StoreError>;

    fn count(&self, entity: EntityKind) -> Result<u64, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY,
    first_name      TEXT NOT NULL,
    last_name       TEXT NOT NULL,
    email           TEXT NOT NULL UNIQUE,
    gender          TEXT NOT NULL,
    favorite_genres TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tracks (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL,
    artist      TEXT NOT NULL,
    songwriters TEXT,
    duration    TEXT NOT NULL,
    genres      TEXT NOT NULL,
    album       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS listen_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    INTEGER NOT NULL REFERENCES users(id),
    track_id   INTEGER NOT NULL REFERENCES tracks(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, track_id, updated_at)
);
CREATE INDEX IF NOT EXISTS idx_users_email ON users (email);
CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks (artist);
CREATE INDEX IF NOT EXISTS idx_listen_history_user_id ON listen_history (user_id);
CREATE INDEX IF NOT EXISTS idx_listen_history_track_id ON listen_history (track_id);
";

/// Timestamp layout persisted in TEXT columns.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

fn ts_to_sql(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn ts_from_sql(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT).unwrap_or_default()
}

/// SQLite-backed [`DestinationStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self::from_connection(Connection::open(path.as_ref())?)?;
        info!(path = %path.as_ref().display(), "destination store opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Test and debugging helper; not part of the loader contract.
    pub fn get_track(&self, id: i64) -> Result<Option<Track>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let track = conn
            .query_row(
                "SELECT id, name, artist, songwriters, duration, genres, album,
                        created_at, updated_at
                 FROM tracks WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Track {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        artist: row.get(2)?,
                        songwriters: row.get(3)?,
                        duration: row.get(4)?,
                        genres: row.get(5)?,
                        album: row.get(6)?,
                        created_at: ts_from_sql(&row.get::<_, String>(7)?),
                        updated_at: ts_from_sql(&row.get::<_, String>(8)?),
                    })
                },
            )
            .optional()?;
        Ok(track)
    }
}

impl DestinationStore for SqliteStore {
    fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO users (id, first_name, last_name, email, gender,
                                favorite_genres, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET
                 first_name = excluded.first_name,
                 last_name = excluded.last_name,
                 email = excluded.email,
                 gender = excluded.gender,
                 favorite_genres = excluded.favorite_genres,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at",
            params![
                user.id,
                user.first_name,
                user.last_name,
                user.email,
                user.gender,
                user.favorite_genres,
                ts_to_sql(user.created_at),
                ts_to_sql(user.updated_at),
            ],
        )?;
        Ok(())
    }

    fn upsert_track(&self, track: &Track) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO tracks (id, name, artist, songwriters, duration,
                                 genres, album, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 artist = excluded.artist,
                 songwriters = excluded.songwriters,
                 duration = excluded.duration,
                 genres = excluded.genres,
                 album = excluded.album,
                 created_at = excluded.created_at,
                 updated_at = excluded.updated_at",
            params![
                track.id,
                track.name,
                track.artist,
                track.songwriters,
                track.duration,
                track.genres,
                track.album,
                ts_to_sql(track.created_at),
                ts_to_sql(track.updated_at),
            ],
        )?;
        Ok(())
    }

    fn user_exists(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn track_exists(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM tracks WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_listen(&self, row: &ListenHistory) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let changed = conn.execute(
            "INSERT INTO listen_history (user_id, track_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, track_id, updated_at) DO NOTHING",
            params![
                row.user_id,
                row.track_id,
                ts_to_sql(row.created_at),
                ts_to_sql(row.updated_at),
            ],
        )?;
        if changed == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    fn user_emails(&self) -> Result<HashMap<String, i64>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT email, id FROM users")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<HashMap<_, _>, _>>().map_err(Into::into)
    }

    fn count(&self, entity: EntityKind) -> Result<u64, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let query = format!("SELECT COUNT(*) FROM {}", entity.table());
        let count: u64 = conn.query_row(&query, [], |row| row.get(0))?;
        Ok(count)
    }
}
