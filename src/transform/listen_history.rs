//! Listening-history validation and expansion.
//!
//! The upstream endpoint groups plays per user:
//! `{ "user_id": 1, "items": [101, 102], "created_at": ..., "updated_at": ... }`.
//! Each entry in `items` becomes one [`ListenHistory`] row carrying the
//! enclosing record's timestamps, so one raw record can yield several rows
//! and several rejections at once.

use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::model::{EntityKind, ListenHistory, RawBatch};
use crate::transform::{
    require_i64, require_timestamp, RejectReason, TransformContext, TransformOutcome, Transformer,
};

pub struct ListenHistoryTransformer;

impl Transformer for ListenHistoryTransformer {
    type Entity = ListenHistory;

    fn entity(&self) -> EntityKind {
        EntityKind::ListenHistory
    }

    fn transform(&self, raw: RawBatch, _ctx: &TransformContext) -> TransformOutcome<ListenHistory> {
        let input = raw.len();
        let mut outcome = TransformOutcome::new();
        // Natural identity of an expanded row; duplicates within the batch
        // would defeat the loader's insert-if-absent idempotence accounting.
        let mut seen: HashSet<(i64, i64, chrono::NaiveDateTime)> = HashSet::new();

        for record in raw {
            let (user_id, created_at, updated_at) = match (
                require_i64(&record, "user_id"),
                require_timestamp(&record, "created_at"),
                require_timestamp(&record, "updated_at"),
            ) {
                (Ok(u), Ok(c), Ok(t)) => (u, c, t),
                (Err(reason), _, _) | (_, Err(reason), _) | (_, _, Err(reason)) => {
                    outcome.reject(record, reason);
                    continue;
                }
            };

            if created_at > updated_at {
                outcome.reject(record, RejectReason::TimestampOrder);
                continue;
            }

            let items = match record.get("items") {
                None => {
                    outcome.reject(record, RejectReason::MissingField("items"));
                    continue;
                }
                Some(Value::Array(items)) => items.clone(),
                Some(_) => {
                    outcome.reject(record, RejectReason::InvalidItems);
                    continue;
                }
            };

            for item in items {
                let track_id = match item.as_i64() {
                    Some(id) if id >= 0 => id,
                    _ => {
                        outcome.reject(
                            record.clone(),
                            RejectReason::InvalidTrackRef(item.to_string()),
                        );
                        continue;
                    }
                };

                if !seen.insert((user_id, track_id, updated_at)) {
                    outcome.reject(record.clone(), RejectReason::DuplicateId(track_id));
                    continue;
                }

                outcome.valid.push(ListenHistory {
                    user_id,
                    track_id,
                    created_at,
                    updated_at,
                });
            }
        }

        info!(
            input,
            rows = outcome.valid.len(),
            rejected = outcome.rejected.len(),
            "listen history transformed"
        );
        for rejected in &outcome.rejected {
            warn!(reason = %rejected.reason, "listen history record rejected");
        }
        outcome
    }
}
