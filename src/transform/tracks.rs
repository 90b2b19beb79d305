//! Track record validation.

use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};

use crate::model::{EntityKind, RawBatch, Track};
use crate::transform::{
    clean_genres, optional_string, require_i64, require_string, require_timestamp, RejectReason,
    TransformContext, TransformOutcome, Transformer,
};

/// Validates track records; duplicate detection is by natural identifier.
pub struct TracksTransformer;

impl TracksTransformer {
    fn parse_record(&self, record: &Value) -> Result<Track, RejectReason> {
        Ok(Track {
            id: require_i64(record, "id")?,
            name: require_string(record, "name")?,
            artist: require_string(record, "artist")?,
            songwriters: optional_string(record, "songwriters"),
            duration: validate_duration(record)?,
            genres: clean_genres(record, "genres")?,
            album: optional_string(record, "album"),
            created_at: require_timestamp(record, "created_at")?,
            updated_at: require_timestamp(record, "updated_at")?,
        })
    }
}

/// Durations must be `MM:SS` with seconds in 0–59. Minutes are unbounded
/// (some tracks genuinely run over an hour).
fn validate_duration(record: &Value) -> Result<String, RejectReason> {
    let raw = require_string(record, "duration")?;

    let invalid = || RejectReason::InvalidDuration(raw.clone());
    let (minutes, seconds) = raw.split_once(':').ok_or_else(invalid)?;

    if minutes.is_empty() || !minutes.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let seconds: u32 = seconds.parse().map_err(|_| invalid())?;
    if seconds > 59 {
        return Err(invalid());
    }

    Ok(raw)
}

impl Transformer for TracksTransformer {
    type Entity = Track;

    fn entity(&self) -> EntityKind {
        EntityKind::Tracks
    }

    fn transform(&self, raw: RawBatch, _ctx: &TransformContext) -> TransformOutcome<Track> {
        let input = raw.len();
        let mut outcome = TransformOutcome::new();
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for record in raw {
            let track = match self.parse_record(&record) {
                Ok(track) => track,
                Err(reason) => {
                    outcome.reject(record, reason);
                    continue;
                }
            };

            if !seen_ids.insert(track.id) {
                outcome.reject(record, RejectReason::DuplicateId(track.id));
                continue;
            }
            outcome.valid.push(track);
        }

        info!(
            input,
            valid = outcome.valid.len(),
            rejected = outcome.rejected.len(),
            "tracks transformed"
        );
        for rejected in &outcome.rejected {
            warn!(reason = %rejected.reason, "track record rejected");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_track(id: i64) -> Value {
        json!({
            "id": id,
            "name": "Kashmir",
            "artist": "Led Zeppelin",
            "songwriters": "Page, Plant, Bonham",
            "duration": "08:37",
            "genres": "{Rock, Hard Rock}",
            "album": "Physical Graffiti",
            "created_at": "2024-01-01T00:00:00",
            "updated_at": "2024-01-01T00:00:00",
        })
    }

    #[test]
    fn valid_track_passes() {
        let outcome = TracksTransformer.transform(vec![raw_track(1)], &Default::default());
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.valid[0].genres, "Rock, Hard Rock");
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn blank_name_is_rejected() {
        let mut record = raw_track(1);
        record["name"] = json!("   ");
        let outcome = TracksTransformer.transform(vec![record], &Default::default());
        assert_eq!(outcome.rejected[0].reason, RejectReason::EmptyField("name"));
    }

    #[test]
    fn duration_must_be_mm_ss() {
        for bad in ["8m37s", "08:61", ":30", "08:", "490"] {
            let mut record = raw_track(1);
            record["duration"] = json!(bad);
            let outcome = TracksTransformer.transform(vec![record], &Default::default());
            assert!(
                matches!(outcome.rejected[0].reason, RejectReason::InvalidDuration(_)),
                "expected rejection for duration {:?}",
                bad
            );
        }

        // Long-form tracks are fine.
        let mut record = raw_track(1);
        record["duration"] = json!("74:05");
        let outcome = TracksTransformer.transform(vec![record], &Default::default());
        assert_eq!(outcome.valid.len(), 1);
    }

    #[test]
    fn duplicate_id_keeps_first() {
        let mut second = raw_track(1);
        second["name"] = json!("Kashmir (Remaster)");
        let outcome =
            TracksTransformer.transform(vec![raw_track(1), second], &Default::default());

        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.valid[0].name, "Kashmir");
        assert_eq!(outcome.rejected[0].reason, RejectReason::DuplicateId(1));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let mut record = raw_track(3);
        let obj = record.as_object_mut().unwrap();
        obj.remove("songwriters");
        obj.remove("album");

        let outcome = TracksTransformer.transform(vec![record], &Default::default());
        assert_eq!(outcome.valid.len(), 1);
        assert_eq!(outcome.valid[0].songwriters, None);
        assert_eq!(outcome.valid[0].album, None);
    }
}
