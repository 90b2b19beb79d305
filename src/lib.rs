//! ETL core for the music listening platform.
//!
//! Pulls users, tracks and listening history from a paginated upstream API,
//! validates and deduplicates them, and persists them into a relational store
//! with referential integrity intact:
//! - **Extract**: [`extract::PagedExtractor`] over a [`source::SourceReader`]
//! - **Transform**: per-entity [`transform::Transformer`] implementations
//! - **Load**: idempotent [`load::Loader`] variants over a
//!   [`store::DestinationStore`]
//! - **Coordinate**: [`pipeline::CompositeEtl`] enforcing the
//!   users/tracks-before-listen-history ordering

pub mod config;
pub mod extract;
pub mod load;
pub mod model;
pub mod pipeline;
pub mod source;
pub mod store;
pub mod transform;

// Re-export the types a pipeline embedder usually touches.
pub use config::EtlConfig;
pub use model::{EntityKind, ListenHistory, Track, User};
pub use pipeline::{CompositeEtl, CompositeOutcome, LogObserver, RunObserver, RunState};
pub use store::SqliteStore;
