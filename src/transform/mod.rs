//! Validation and normalization of raw batches into typed entities.
//!
//! Validation is an ordered composition of two steps: the generic field-shape
//! checks in this module run first, then the entity-specific rules in the
//! [`users`], [`tracks`] and [`listen_history`] submodules. Rejections are
//! always reported per record with a [`RejectReason`]; a transformer never
//! silently drops data and never touches the destination store — store-derived
//! context arrives through [`TransformContext`], captured by the coordinator
//! before the stage runs.

pub mod listen_history;
pub mod tracks;
pub mod users;

use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{EntityKind, RawBatch};

/// Why a single record was rejected during transformation.
///
/// All variants are per-record and non-fatal: the batch continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid identifier in field: {0}")]
    InvalidId(&'static str),

    #[error("empty field: {0}")]
    EmptyField(&'static str),

    #[error("invalid timestamp in field: {0}")]
    InvalidTimestamp(&'static str),

    #[error("created_at after updated_at")]
    TimestampOrder,

    #[error("invalid gender: {0}")]
    InvalidGender(String),

    #[error("empty genres")]
    EmptyGenres,

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("items is not a list")]
    InvalidItems,

    #[error("invalid track reference: {0}")]
    InvalidTrackRef(String),

    #[error("duplicate email")]
    DuplicateEmail,

    #[error("duplicate identifier: {0}")]
    DuplicateId(i64),
}

/// A rejected record together with its reason, surfaced in the stage summary.
#[derive(Debug, Clone)]
pub struct Rejected {
    pub record: Value,
    pub reason: RejectReason,
}

/// Result of transforming one raw batch.
#[derive(Debug)]
pub struct TransformOutcome<E> {
    pub valid: Vec<E>,
    pub rejected: Vec<Rejected>,
}

impl<E> TransformOutcome<E> {
    pub fn new() -> Self {
        Self {
            valid: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn reject(&mut self, record: Value, reason: RejectReason) {
        self.rejected.push(Rejected { record, reason });
    }
}

impl<E> Default for TransformOutcome<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Store-derived context snapshot handed to a transformer.
///
/// Captured by the pipeline before the transform stage runs, so the
/// transformer itself stays a pure function of its inputs.
#[derive(Debug, Default, Clone)]
pub struct TransformContext {
    /// Emails of already-persisted users, keyed to their ids. A batch record
    /// carrying one of these emails under a different id is duplicate data.
    pub known_emails: HashMap<String, i64>,
}

/// One entity type's validation and normalization rules.
pub trait Transformer: Send + Sync {
    type Entity: Send;

    /// Entity type this transformer handles.
    fn entity(&self) -> EntityKind;

    /// Validates and normalizes a raw batch.
    ///
    /// Pure: the outcome depends only on `raw` and `ctx`. Per-record failures
    /// land in [`TransformOutcome::rejected`]; this never errors as a whole.
    fn transform(&self, raw: RawBatch, ctx: &TransformContext) -> TransformOutcome<Self::Entity>;
}

// ============================================================================
// Shared field validations (generic step, applied before entity rules)
// ============================================================================

/// Accepted timestamp layouts, most specific first. The upstream API emits
/// ISO-8601 with fractional seconds; older rows may carry bare dates.
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];

pub(crate) fn require_i64(record: &Value, field: &'static str) -> Result<i64, RejectReason> {
    let value = record.get(field).ok_or(RejectReason::MissingField(field))?;
    match value {
        Value::Number(n) => n.as_i64().ok_or(RejectReason::InvalidId(field)),
        // Upstream occasionally stringifies numeric ids.
        Value::String(s) => s.trim().parse().map_err(|_| RejectReason::InvalidId(field)),
        _ => Err(RejectReason::InvalidId(field)),
    }
}

pub(crate) fn require_string(record: &Value, field: &'static str) -> Result<String, RejectReason> {
    let value = record.get(field).ok_or(RejectReason::MissingField(field))?;
    let s = value.as_str().ok_or(RejectReason::EmptyField(field))?.trim();
    if s.is_empty() {
        return Err(RejectReason::EmptyField(field));
    }
    Ok(s.to_string())
}

pub(crate) fn optional_string(record: &Value, field: &str) -> Option<String> {
    record
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn require_timestamp(
    record: &Value,
    field: &'static str,
) -> Result<NaiveDateTime, RejectReason> {
    let raw = record
        .get(field)
        .and_then(Value::as_str)
        .ok_or(RejectReason::MissingField(field))?;

    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts);
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(ts) = date.and_hms_opt(0, 0, 0) {
            return Ok(ts);
        }
    }
    Err(RejectReason::InvalidTimestamp(field))
}

/// Strips the upstream brace wrapping from a genre list (`"{Rock, Pop}"` →
/// `"Rock, Pop"`). Empty after cleaning means no usable genres.
pub(crate) fn clean_genres(record: &Value, field: &'static str) -> Result<String, RejectReason> {
    let raw = record
        .get(field)
        .and_then(Value::as_str)
        .ok_or(RejectReason::MissingField(field))?;
    let cleaned = raw.replace(['{', '}'], "").trim().to_string();
    if cleaned.is_empty() {
        return Err(RejectReason::EmptyGenres);
    }
    Ok(cleaned)
}
