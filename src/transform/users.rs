//! User record validation.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::model::{EntityKind, RawBatch, User};
use crate::transform::{
    clean_genres, require_i64, require_string, require_timestamp, RejectReason, TransformContext,
    TransformOutcome, Transformer,
};

/// Gender values accepted by the upstream profile form.
const VALID_GENDERS: &[&str] = &[
    "Agender",
    "Bigender",
    "Female",
    "Genderfluid",
    "Gender nonconforming",
    "Genderqueer",
    "Gender questioning",
    "Male",
    "Non-binary",
];

/// Validates user records and enforces email uniqueness.
///
/// Uniqueness is checked both within the batch (first occurrence wins) and
/// against the snapshot of already-persisted emails in [`TransformContext`];
/// a batch record carrying a known email under a different id is rejected as
/// `duplicate email`. The same id re-appearing with its own email is a
/// legitimate update and passes through to the upsert loader.
pub struct UsersTransformer;

impl UsersTransformer {
    fn parse_record(&self, record: &Value) -> Result<User, RejectReason> {
        let gender = require_string(record, "gender")?;
        if !VALID_GENDERS.contains(&gender.as_str()) {
            return Err(RejectReason::InvalidGender(gender));
        }

        Ok(User {
            id: require_i64(record, "id")?,
            first_name: require_string(record, "first_name")?,
            last_name: require_string(record, "last_name")?,
            email: require_string(record, "email")?.to_lowercase(),
            gender,
            favorite_genres: clean_genres(record, "favorite_genres")?,
            created_at: require_timestamp(record, "created_at")?,
            updated_at: require_timestamp(record, "updated_at")?,
        })
    }
}

impl Transformer for UsersTransformer {
    type Entity = User;

    fn entity(&self) -> EntityKind {
        EntityKind::Users
    }

    fn transform(&self, raw: RawBatch, ctx: &TransformContext) -> TransformOutcome<User> {
        let input = raw.len();
        let mut outcome = TransformOutcome::new();
        let mut seen_emails: HashMap<String, i64> = HashMap::new();

        for record in raw {
            let user = match self.parse_record(&record) {
                Ok(user) => user,
                Err(reason) => {
                    outcome.reject(record, reason);
                    continue;
                }
            };

            if seen_emails.contains_key(&user.email) {
                outcome.reject(record, RejectReason::DuplicateEmail);
                continue;
            }
            if matches!(ctx.known_emails.get(&user.email), Some(&id) if id != user.id) {
                outcome.reject(record, RejectReason::DuplicateEmail);
                continue;
            }

            seen_emails.insert(user.email.clone(), user.id);
            outcome.valid.push(user);
        }

        info!(
            input,
            valid = outcome.valid.len(),
            rejected = outcome.rejected.len(),
            "users transformed"
        );
        for rejected in &outcome.rejected {
            warn!(reason = %rejected.reason, "user record rejected");
        }
        outcome
    }
}
