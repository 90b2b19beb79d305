//! Idempotent, dependency-aware persistence of validated batches.
//!
//! Two behavioral variants share the [`Loader`] contract:
//!
//! - [`UpsertLoader`] (users, tracks): per-record upsert keyed by the natural
//!   identifier, so re-running a batch updates in place and never duplicates
//!   rows.
//! - [`ListenHistoryLoader`]: verifies the referenced user and track exist
//!   before inserting; a missing reference skips that record with a
//!   `missing dependency` failure and the batch continues. Insert-if-absent
//!   on the natural identity makes re-runs no-ops.
//!
//! Failures are always per record. One bad record never blocks the rest of
//! its batch, and nothing is ever persisted dangling.

use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{EntityKind, ListenHistory, Track, User};
use crate::store::{DestinationStore, StoreError};

/// Why a single record failed to persist. Per-record and non-fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadFailureReason {
    #[error("missing dependency: user")]
    MissingUser,

    #[error("missing dependency: track")]
    MissingTrack,

    #[error("persistence failure: {0}")]
    Persistence(String),
}

/// One record that could not be persisted, identified by its natural key.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub key: String,
    pub reason: LoadFailureReason,
}

/// Outcome of loading one validated batch.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Records written or updated in place.
    pub persisted: usize,

    /// Records deliberately not written: already present under the same
    /// natural identity, or skipped over a missing dependency.
    pub skipped: usize,

    /// Per-record failures, including every skipped-over dependency.
    pub failures: Vec<LoadFailure>,
}

/// Persistence stage for one entity type.
///
/// Implementations must be safe to invoke repeatedly with the same input;
/// idempotence is what makes the external scheduler's at-least-once re-runs
/// harmless.
pub trait Loader: Send + Sync {
    type Entity: Send;

    fn entity(&self) -> EntityKind;

    /// Persists a validated batch, one record at a time. Per-record errors
    /// land in the report; this never aborts the batch as a whole.
    fn load(&self, batch: &[Self::Entity]) -> LoadReport;
}

// ============================================================================
// Direct upsert variant (users, tracks)
// ============================================================================

/// Entity that persists through a natural-key upsert.
pub trait UpsertEntity: Send + Sync {
    fn kind() -> EntityKind;
    fn key(&self) -> i64;
    fn upsert(&self, store: &dyn DestinationStore) -> Result<(), StoreError>;
}

impl UpsertEntity for User {
    fn kind() -> EntityKind {
        EntityKind::Users
    }
    fn key(&self) -> i64 {
        self.id
    }
    fn upsert(&self, store: &dyn DestinationStore) -> Result<(), StoreError> {
        store.upsert_user(self)
    }
}

impl UpsertEntity for Track {
    fn kind() -> EntityKind {
        EntityKind::Tracks
    }
    fn key(&self) -> i64 {
        self.id
    }
    fn upsert(&self, store: &dyn DestinationStore) -> Result<(), StoreError> {
        store.upsert_track(self)
    }
}

/// Generic upsert loader, shared by every entity without referential
/// dependencies.
pub struct UpsertLoader<E: UpsertEntity> {
    store: Arc<dyn DestinationStore>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: UpsertEntity> UpsertLoader<E> {
    pub fn new(store: Arc<dyn DestinationStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }
}

impl<E: UpsertEntity> Loader for UpsertLoader<E> {
    type Entity = E;

    fn entity(&self) -> EntityKind {
        E::kind()
    }

    fn load(&self, batch: &[E]) -> LoadReport {
        let mut report = LoadReport::default();

        for record in batch {
            match record.upsert(self.store.as_ref()) {
                Ok(()) => report.persisted += 1,
                Err(e) => {
                    warn!(entity = %E::kind(), key = record.key(), error = %e, "record not persisted");
                    report.failures.push(LoadFailure {
                        key: record.key().to_string(),
                        reason: LoadFailureReason::Persistence(e.to_string()),
                    });
                }
            }
        }

        info!(
            entity = %E::kind(),
            persisted = report.persisted,
            failures = report.failures.len(),
            "load completed"
        );
        report
    }
}

// ============================================================================
// Dependency-checked variant (listen history)
// ============================================================================

/// Loader for listening history. Checks both referenced rows exist before
/// each insert so a dangling reference is never committed.
pub struct ListenHistoryLoader {
    store: Arc<dyn DestinationStore>,
}

impl ListenHistoryLoader {
    pub fn new(store: Arc<dyn DestinationStore>) -> Self {
        Self { store }
    }

    fn load_one(&self, row: &ListenHistory) -> Result<Option<i64>, LoadFailureReason> {
        let persistence = |e: StoreError| LoadFailureReason::Persistence(e.to_string());

        if !self.store.user_exists(row.user_id).map_err(persistence)? {
            return Err(LoadFailureReason::MissingUser);
        }
        if !self.store.track_exists(row.track_id).map_err(persistence)? {
            return Err(LoadFailureReason::MissingTrack);
        }
        self.store.insert_listen(row).map_err(persistence)
    }
}

impl Loader for ListenHistoryLoader {
    type Entity = ListenHistory;

    fn entity(&self) -> EntityKind {
        EntityKind::ListenHistory
    }

    fn load(&self, batch: &[ListenHistory]) -> LoadReport {
        let mut report = LoadReport::default();

        for row in batch {
            let key = format!("user={} track={}", row.user_id, row.track_id);
            match self.load_one(row) {
                Ok(Some(_)) => report.persisted += 1,
                // Already present under the same natural identity.
                Ok(None) => report.skipped += 1,
                Err(reason) => {
                    warn!(%key, %reason, "listen history record skipped");
                    report.skipped += 1;
                    report.failures.push(LoadFailure { key, reason });
                }
            }
        }

        info!(
            entity = %self.entity(),
            persisted = report.persisted,
            skipped = report.skipped,
            failures = report.failures.len(),
            "load completed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn store_with_user_and_track() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .upsert_user(&User {
                id: 1,
                first_name: "Miles".to_string(),
                last_name: "Davis".to_string(),
                email: "miles@x.com".to_string(),
                gender: "Male".to_string(),
                favorite_genres: "Jazz".to_string(),
                created_at: "2024-01-01T00:00:00".parse().unwrap(),
                updated_at: "2024-01-01T00:00:00".parse().unwrap(),
            })
            .unwrap();
        store
            .upsert_track(&track(10, "So What"))
            .unwrap();
        store
    }

    fn track(id: i64, name: &str) -> Track {
        Track {
            id,
            name: name.to_string(),
            artist: "Miles Davis".to_string(),
            songwriters: Some("Miles Davis".to_string()),
            duration: "09:22".to_string(),
            genres: "Jazz".to_string(),
            album: Some("Kind of Blue".to_string()),
            created_at: "2024-01-01T00:00:00".parse().unwrap(),
            updated_at: "2024-01-01T00:00:00".parse().unwrap(),
        }
    }

    fn listen(user_id: i64, track_id: i64) -> ListenHistory {
        ListenHistory {
            user_id,
            track_id,
            created_at: "2024-02-01T08:00:00".parse().unwrap(),
            updated_at: "2024-02-01T09:00:00".parse().unwrap(),
        }
    }

    #[test]
    fn rerunning_track_loader_updates_in_place() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let loader = UpsertLoader::<Track>::new(store.clone());

        let report = loader.load(&[track(10, "So What")]);
        assert_eq!(report.persisted, 1);

        // Same id, changed name: updated in place, row count unchanged.
        let report = loader.load(&[track(10, "So What (Mono)")]);
        assert_eq!(report.persisted, 1);
        assert!(report.failures.is_empty());
        assert_eq!(store.count(EntityKind::Tracks).unwrap(), 1);
        assert_eq!(store.get_track(10).unwrap().unwrap().name, "So What (Mono)");
    }

    #[test]
    fn one_bad_record_does_not_block_the_rest() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let loader = UpsertLoader::<User>::new(store.clone());

        let mut first = user_record(1, "a@x.com");
        let conflicting = user_record(2, "a@x.com"); // violates email uniqueness
        let third = user_record(3, "c@x.com");
        first.first_name = "First".to_string();

        let report = loader.load(&[first, conflicting, third]);

        assert_eq!(report.persisted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, "2");
        assert!(matches!(
            report.failures[0].reason,
            LoadFailureReason::Persistence(_)
        ));
        assert_eq!(store.count(EntityKind::Users).unwrap(), 2);
    }

    fn user_record(id: i64, email: &str) -> User {
        User {
            id,
            first_name: "Sun".to_string(),
            last_name: "Ra".to_string(),
            email: email.to_string(),
            gender: "Male".to_string(),
            favorite_genres: "Jazz".to_string(),
            created_at: "2024-01-01T00:00:00".parse().unwrap(),
            updated_at: "2024-01-01T00:00:00".parse().unwrap(),
        }
    }

    #[test]
    fn missing_track_is_skipped_with_reason_and_nothing_committed() {
        let store = store_with_user_and_track();
        let loader = ListenHistoryLoader::new(store.clone());

        let report = loader.load(&[listen(1, 999)]);

        assert_eq!(report.persisted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason, LoadFailureReason::MissingTrack);
        assert_eq!(
            report.failures[0].reason.to_string(),
            "missing dependency: track"
        );
        assert_eq!(store.count(EntityKind::ListenHistory).unwrap(), 0);
    }

    #[test]
    fn missing_user_is_skipped_with_reason() {
        let store = store_with_user_and_track();
        let loader = ListenHistoryLoader::new(store.clone());

        let report = loader.load(&[listen(999, 10)]);

        assert_eq!(report.failures[0].reason, LoadFailureReason::MissingUser);
        assert_eq!(
            report.failures[0].reason.to_string(),
            "missing dependency: user"
        );
        assert_eq!(store.count(EntityKind::ListenHistory).unwrap(), 0);
    }

    #[test]
    fn missing_dependency_does_not_abort_the_batch() {
        let store = store_with_user_and_track();
        let loader = ListenHistoryLoader::new(store.clone());

        let report = loader.load(&[listen(1, 999), listen(1, 10)]);

        assert_eq!(report.persisted, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(store.count(EntityKind::ListenHistory).unwrap(), 1);
    }

    #[test]
    fn loading_the_same_batch_twice_changes_nothing() {
        let store = store_with_user_and_track();
        let loader = ListenHistoryLoader::new(store.clone());
        let batch = vec![listen(1, 10)];

        let first = loader.load(&batch);
        let second = loader.load(&batch);

        assert_eq!(first.persisted, 1);
        assert_eq!(second.persisted, 0);
        assert_eq!(second.skipped, 1);
        assert!(second.failures.is_empty());
        assert_eq!(store.count(EntityKind::ListenHistory).unwrap(), 1);
    }
}
