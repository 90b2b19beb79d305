//! Pipeline coordination.
//!
//! [`EtlPipeline`] drives one entity type through Extract → Transform → Load
//! as a strict state machine, reporting every transition to a [`RunObserver`]
//! (the seam the external scheduler consumes). [`CompositeEtl`] runs several
//! pipelines as an explicit dependency graph: a stage starts only after all
//! of its declared predecessors have succeeded, and independent stages run
//! concurrently. The standard wiring ([`CompositeEtl::standard`]) runs users
//! and tracks first, then listen history, because the listen-history loader's
//! dependency checks require those rows to be present.
//!
//! No retry lives here. A failed stage marks the run `failed` and the outcome
//! is reported; idempotent loaders make a whole-run re-invocation by the
//! scheduler safe.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::extract::PagedExtractor;
use crate::load::{ListenHistoryLoader, LoadReport, Loader, UpsertLoader};
use crate::model::{EntityKind, Track, User};
use crate::source::{SourceError, SourceReader};
use crate::store::{DestinationStore, StoreError};
use crate::transform::listen_history::ListenHistoryTransformer;
use crate::transform::tracks::TracksTransformer;
use crate::transform::users::UsersTransformer;
use crate::transform::{TransformContext, Transformer};

/// States of one pipeline run. Transitions are sequential; `Succeeded` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Extracting,
    Transforming,
    Loading,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Extracting => "extracting",
            RunState::Transforming => "transforming",
            RunState::Loading => "loading",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Consumer of state transitions, typically the external scheduler's
/// reporting hook. Must tolerate being called from concurrent runs.
pub trait RunObserver: Send + Sync {
    fn on_transition(&self, pipeline: &str, state: RunState);
}

/// Default observer: structured log lines only.
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn on_transition(&self, pipeline: &str, state: RunState) {
        info!(%pipeline, %state, "pipeline transition");
    }
}

/// Stage-level failures. Any of these marks the run `failed`; per-record
/// problems never surface here, they stay in the run outcome's counts.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("extraction of {entity} failed: {source}")]
    Extraction {
        entity: EntityKind,
        source: SourceError,
    },

    #[error("destination store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("stage task aborted: {0}")]
    Task(String),
}

/// Summary of one finished pipeline run.
#[derive(Debug)]
pub struct RunOutcome {
    pub pipeline: String,
    pub extracted: usize,
    pub valid: usize,
    pub rejected: usize,
    pub load: LoadReport,
}

/// Object-safe face of a runnable pipeline, so differently-typed entity
/// pipelines compose into one dependency graph.
#[async_trait]
pub trait PipelineRun: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, observer: &dyn RunObserver) -> Result<RunOutcome, PipelineError>;
}

// ============================================================================
// Single-entity pipeline
// ============================================================================

/// Extract → Transform → Load for one entity type.
pub struct EtlPipeline<R, T, L>
where
    R: SourceReader,
    T: Transformer,
    L: Loader<Entity = T::Entity>,
{
    name: String,
    extractor: PagedExtractor<R>,
    transformer: T,
    loader: Arc<L>,
    store: Arc<dyn DestinationStore>,
}

impl<R, T, L> EtlPipeline<R, T, L>
where
    R: SourceReader,
    T: Transformer,
    L: Loader<Entity = T::Entity>,
    T::Entity: 'static,
    L: 'static,
{
    pub fn new(
        extractor: PagedExtractor<R>,
        transformer: T,
        loader: L,
        store: Arc<dyn DestinationStore>,
    ) -> Self {
        Self {
            name: transformer.entity().to_string(),
            extractor,
            transformer,
            loader: Arc::new(loader),
            store,
        }
    }

    /// Builds the transformer's store snapshot. Only the users pipeline needs
    /// one today; the snapshot keeps the transform stage pure.
    async fn transform_context(&self) -> Result<TransformContext, PipelineError> {
        if self.transformer.entity() != EntityKind::Users {
            return Ok(TransformContext::default());
        }
        let store = self.store.clone();
        let known_emails = tokio::task::spawn_blocking(move || store.user_emails())
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        Ok(TransformContext { known_emails })
    }

    fn fail(&self, observer: &dyn RunObserver, err: PipelineError) -> PipelineError {
        error!(pipeline = %self.name, error = %err, "pipeline run failed");
        observer.on_transition(&self.name, RunState::Failed);
        err
    }
}

#[async_trait]
impl<R, T, L> PipelineRun for EtlPipeline<R, T, L>
where
    R: SourceReader,
    T: Transformer,
    L: Loader<Entity = T::Entity> + 'static,
    T::Entity: 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, observer: &dyn RunObserver) -> Result<RunOutcome, PipelineError> {
        let entity = self.transformer.entity();
        observer.on_transition(&self.name, RunState::Pending);

        observer.on_transition(&self.name, RunState::Extracting);
        let raw = match self.extractor.extract(entity).await {
            Ok(raw) => raw,
            Err(source) => {
                return Err(self.fail(observer, PipelineError::Extraction { entity, source }))
            }
        };
        let extracted = raw.len();

        observer.on_transition(&self.name, RunState::Transforming);
        let ctx = match self.transform_context().await {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.fail(observer, e)),
        };
        let outcome = self.transformer.transform(raw, &ctx);
        let rejected = outcome.rejected.len();
        let valid = outcome.valid.len();

        observer.on_transition(&self.name, RunState::Loading);
        let loader = self.loader.clone();
        let batch = outcome.valid;
        let load = match tokio::task::spawn_blocking(move || loader.load(&batch)).await {
            Ok(report) => report,
            Err(e) => return Err(self.fail(observer, PipelineError::Task(e.to_string()))),
        };

        observer.on_transition(&self.name, RunState::Succeeded);
        info!(
            pipeline = %self.name,
            extracted,
            valid,
            rejected,
            persisted = load.persisted,
            skipped = load.skipped,
            load_failures = load.failures.len(),
            "pipeline run succeeded"
        );

        Ok(RunOutcome {
            pipeline: self.name.clone(),
            extracted,
            valid,
            rejected,
            load,
        })
    }
}

// ============================================================================
// Composite pipeline with explicit stage dependencies
// ============================================================================

struct Node {
    pipeline: Arc<dyn PipelineRun>,
    after: Vec<String>,
}

/// Outcome of a composite run. `succeeded()` only when every stage ran and
/// reached `Succeeded`.
#[derive(Debug, Default)]
pub struct CompositeOutcome {
    pub outcomes: Vec<RunOutcome>,
    pub failed: Vec<(String, PipelineError)>,
    /// Stages never started because a declared predecessor did not succeed.
    pub skipped: Vec<String>,
}

impl CompositeOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Runs pipelines as a directed acyclic dependency graph.
///
/// Stages with all predecessors succeeded run concurrently; a stage whose
/// predecessor failed is skipped, never started. The graph is declared, not
/// implied by call order.
pub struct CompositeEtl {
    name: String,
    nodes: Vec<Node>,
}

impl CompositeEtl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Adds a stage that may start once every pipeline named in `after`
    /// has succeeded.
    pub fn stage(mut self, pipeline: Arc<dyn PipelineRun>, after: &[&str]) -> Self {
        self.nodes.push(Node {
            pipeline,
            after: after.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// The standard three-entity wiring: users and tracks in parallel, listen
    /// history only after both succeeded.
    pub fn standard(
        reader: Arc<dyn SourceReader>,
        store: Arc<dyn DestinationStore>,
        page_size: u32,
    ) -> Self {
        let users = EtlPipeline::new(
            PagedExtractor::new(reader.clone()).with_page_size(page_size),
            UsersTransformer,
            UpsertLoader::<User>::new(store.clone()),
            store.clone(),
        );
        let tracks = EtlPipeline::new(
            PagedExtractor::new(reader.clone()).with_page_size(page_size),
            TracksTransformer,
            UpsertLoader::<Track>::new(store.clone()),
            store.clone(),
        );
        let listen_history = EtlPipeline::new(
            PagedExtractor::new(reader).with_page_size(page_size),
            ListenHistoryTransformer,
            ListenHistoryLoader::new(store.clone()),
            store,
        );

        Self::new("music_etl")
            .stage(Arc::new(users), &[])
            .stage(Arc::new(tracks), &[])
            .stage(Arc::new(listen_history), &["users", "tracks"])
    }

    /// Runs the whole graph to completion and reports per-stage outcomes.
    pub async fn run(&self, observer: Arc<dyn RunObserver>) -> CompositeOutcome {
        let mut result = CompositeOutcome::default();
        // name -> whether that stage succeeded
        let mut finished: HashMap<String, bool> = HashMap::new();
        let mut remaining: Vec<&Node> = self.nodes.iter().collect();

        info!(composite = %self.name, stages = remaining.len(), "composite run started");

        while !remaining.is_empty() {
            // Cascade skips: a stage under a failed or skipped predecessor
            // will never become ready.
            let mut still_blocked = Vec::new();
            for node in remaining.drain(..) {
                let name = node.pipeline.name().to_string();
                if node
                    .after
                    .iter()
                    .any(|dep| matches!(finished.get(dep), Some(false)))
                {
                    info!(composite = %self.name, stage = %name, "stage skipped, predecessor failed");
                    finished.insert(name.clone(), false);
                    result.skipped.push(name);
                } else {
                    still_blocked.push(node);
                }
            }
            remaining = still_blocked;

            let (ready, blocked): (Vec<&Node>, Vec<&Node>) =
                remaining.into_iter().partition(|node| {
                    node.after
                        .iter()
                        .all(|dep| matches!(finished.get(dep), Some(true)))
                });
            remaining = blocked;

            if ready.is_empty() {
                if !remaining.is_empty() {
                    // Unsatisfiable dependencies (unknown name or cycle).
                    for node in remaining.drain(..) {
                        result.skipped.push(node.pipeline.name().to_string());
                    }
                }
                break;
            }

            let mut tasks = tokio::task::JoinSet::new();
            for node in ready {
                let pipeline = node.pipeline.clone();
                let observer = observer.clone();
                tasks.spawn(async move {
                    let outcome = pipeline.run(observer.as_ref()).await;
                    (pipeline.name().to_string(), outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, Ok(outcome))) => {
                        finished.insert(name, true);
                        result.outcomes.push(outcome);
                    }
                    Ok((name, Err(e))) => {
                        finished.insert(name.clone(), false);
                        result.failed.push((name, e));
                    }
                    Err(join_error) => {
                        error!(composite = %self.name, %join_error, "stage task panicked");
                        result
                            .failed
                            .push(("<unknown>".to_string(), PipelineError::Task(join_error.to_string())));
                    }
                }
            }
        }

        info!(
            composite = %self.name,
            succeeded = result.outcomes.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            "composite run finished"
        );
        result
    }
}
