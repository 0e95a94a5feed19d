/// The model core: control state plus the partitions it governs.
///
/// [`Model`] holds everything one chain owns and implements every operation
/// on it. It has no synchronization of its own; the actor in
/// [`crate::core`] owns it exclusively and runs operations one at a time.
///
/// # Layout on disk
///
/// ```text
/// <model_dir>/
///   model.state          control state (see persistence)
///   partitions/<id>.part one file per partition
///   history.log          audit log, if enabled
/// ```
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::cache::{IdleNotice, PartitionCache};
use crate::error::{ChainError, ChainResult};
use crate::history::{EventPayload, HistoryLog};
use crate::options::{ModelOptions, OptionsUpdate};
use crate::persistence;
use crate::query::TagQuery;
use crate::reshard::{ReshardProgress, ReshardSummary};
use crate::ring::{PartitionId, PartitionRing};
use crate::shift::ShiftCurve;
use crate::transition::{self, TrainRequest};
use crate::types::{Context, EdgeRecord, Tag, Token};

const PARTITION_DIR: &str = "partitions";
const HISTORY_FILE: &str = "history.log";

/// Persisted control state of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Current options
    pub options: ModelOptions,
    /// Committed ring
    pub ring: PartitionRing,
    /// Target ring while resharding
    pub new_ring: Option<PartitionRing>,
    /// Windows trained since creation
    pub total_link_count: u64,
    /// Progress of an in-flight resharding
    pub resharding: Option<ReshardProgress>,
    /// Training requests received while resharding
    pub deferred: VecDeque<TrainRequest>,
}

impl ModelState {
    /// Fresh state for a new model with a single partition.
    pub fn new(options: ModelOptions) -> Self {
        Self {
            options,
            ring: PartitionRing::new(),
            new_ring: None,
            total_link_count: 0,
            resharding: None,
            deferred: VecDeque::new(),
        }
    }

    /// True while a resharding is in flight.
    pub fn is_resharding(&self) -> bool {
        self.resharding.is_some()
    }

    /// The partition currently authoritative for `context`.
    pub fn route(&self, context: &Context) -> PartitionId {
        match (&self.resharding, &self.new_ring) {
            (Some(progress), Some(new_ring)) => progress.route(&self.ring, new_ring, context),
            _ => self.ring.locate(context),
        }
    }

    fn capacity(&self) -> u64 {
        u64::from(self.ring.partition_count()).saturating_mul(self.options.partition_size)
    }
}

/// Result of a training call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainOutcome {
    /// Edges were written
    Accepted,
    /// The model is resharding; the request was queued and will be applied
    /// when resharding completes
    Deferred,
}

/// Snapshot of model statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub order: usize,
    pub partitions: u32,
    pub open_partitions: Vec<PartitionId>,
    pub total_link_count: u64,
    pub resharding: bool,
    pub migrated_contexts: usize,
    pub deferred_writes: usize,
    pub options: ModelOptions,
}

/// One loaded model.
pub struct Model {
    dir: PathBuf,
    state: ModelState,
    cache: PartitionCache,
    history: HistoryLog,
    curve: ShiftCurve,
    rng: StdRng,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("dir", &self.dir)
            .field("state", &self.state)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Model {
    /// Load the model stored in `dir`, creating it with `options` if the
    /// directory holds no model yet.
    ///
    /// For an existing model the immutable options in `options` must match
    /// the stored ones; all other stored options win. Idle notices for this
    /// model's partitions are sent on `notices`.
    ///
    /// # Errors
    ///
    /// `InvalidOptions` for unusable creation options, `ConfigurationConflict`
    /// on an immutable mismatch, `CorruptState` if the stored state cannot be
    /// decoded.
    pub async fn open(
        dir: impl Into<PathBuf>,
        options: ModelOptions,
        notices: mpsc::UnboundedSender<IdleNotice>,
    ) -> ChainResult<Self> {
        let dir = dir.into();
        options.validate()?;

        let state = if persistence::exists(&dir).await {
            let state = persistence::load(&dir).await?;
            state.options.check_compatible(&options)?;
            state
        } else {
            let state = ModelState::new(options);
            persistence::save(&dir, &state).await?;
            info!(path = %dir.display(), "Created model");
            state
        };

        let cache = PartitionCache::new(
            dir.join(PARTITION_DIR),
            state.options.partition_idle_timeout,
            notices,
        );
        let history = HistoryLog::new(dir.join(HISTORY_FILE), state.options.store_history.clone());

        let mut model = Self {
            dir,
            state,
            cache,
            history,
            curve: ShiftCurve::default(),
            rng: StdRng::from_entropy(),
        };

        model.history.record(EventPayload::Start {
            order: model.state.options.order,
            partitions: model.state.ring.partition_count(),
        });
        info!(
            path = %model.dir.display(),
            order = model.state.options.order,
            partitions = model.state.ring.partition_count(),
            resharding = model.state.is_resharding(),
            "Model loaded"
        );

        if !model.state.is_resharding() && !model.state.deferred.is_empty() {
            model.replay_backlog().await;
        }
        Ok(model)
    }

    /// Directory this model is stored in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current control state.
    pub fn state(&self) -> &ModelState {
        &self.state
    }

    /// True while a resharding is in flight.
    pub fn is_resharding(&self) -> bool {
        self.state.is_resharding()
    }

    /// Learn a token sequence under `tags`.
    ///
    /// While resharding the request is queued instead and
    /// [`TrainOutcome::Deferred`] is returned. Sequences containing `Start`
    /// or `End` are rejected with [`ChainError::ReservedToken`].
    pub async fn train(&mut self, tokens: Vec<Token>, tags: Vec<Tag>) -> ChainResult<TrainOutcome> {
        transition::check_tokens(&tokens)?;
        let request = TrainRequest { tokens, tags };

        if self.state.is_resharding() {
            self.history.record(EventPayload::TrainDeferred {
                tokens: request.tokens.clone(),
                tags: request.tags.clone(),
            });
            self.state.deferred.push_back(request);
            debug!(backlog = self.state.deferred.len(), "Deferred training request");
            self.persist().await?;
            return Ok(TrainOutcome::Deferred);
        }

        self.apply_train(&request)?;
        self.history.record(EventPayload::Train {
            tokens: request.tokens,
            tags: request.tags,
        });
        if self.maybe_begin_resharding() {
            self.persist().await?;
        }
        Ok(TrainOutcome::Accepted)
    }

    fn apply_train(&mut self, request: &TrainRequest) -> ChainResult<()> {
        let options = &self.state.options;
        let windows = transition::windows(options.order, &request.tokens, options.sanitize_tokens);
        let tags = request.effective_tags();

        let routed: Vec<(PartitionId, Context, Token)> = windows
            .into_iter()
            .map(|(context, target)| (self.state.route(&context), context, target))
            .collect();

        // Open everything first so an I/O failure leaves no partial write.
        let ids: BTreeSet<PartitionId> = routed.iter().map(|(id, _, _)| *id).collect();
        for id in ids {
            self.cache.acquire(id)?;
        }

        for (id, context, target) in &routed {
            let partition = self.cache.acquire(*id)?;
            for tag in &tags {
                partition.increment(context, tag, target);
            }
            self.state.total_link_count += 1;
        }
        trace!(windows = routed.len(), total = self.state.total_link_count, "Trained sequence");
        Ok(())
    }

    /// Start resharding if the model has outgrown its partitions.
    fn maybe_begin_resharding(&mut self) -> bool {
        if self.state.is_resharding() || self.state.total_link_count <= self.state.capacity() {
            return false;
        }
        let (new_ring, progress) = ReshardProgress::begin(&self.state.ring, self.state.total_link_count);
        let partitions = new_ring.partition_count();
        self.state.new_ring = Some(new_ring);
        self.state.resharding = Some(progress);

        self.history.record(EventPayload::RepartitionStart {
            partitions,
            total_link_count: self.state.total_link_count,
        });
        info!(
            partitions,
            total_link_count = self.state.total_link_count,
            "Resharding started"
        );
        true
    }

    /// Run one resharding step: scan one old partition, or commit once every
    /// partition has been scanned.
    ///
    /// Returns the summary when this step committed the new ring.
    pub async fn reshard_step(&mut self) -> ChainResult<Option<ReshardSummary>> {
        let (Some(progress), Some(new_ring)) = (self.state.resharding.as_mut(), self.state.new_ring.as_ref())
        else {
            return Ok(None);
        };

        if !progress.is_scan_complete() {
            progress.step(&mut self.cache, new_ring)?;
            // Copies must be on disk before the progress that points at them.
            self.cache.flush_all()?;
            self.persist().await?;
            return Ok(None);
        }

        let summary = progress.finish(&mut self.cache, new_ring)?;
        self.cache.flush_all()?;

        if let Some(new_ring) = self.state.new_ring.take() {
            self.state.ring = new_ring;
        }
        self.state.resharding = None;

        self.history.record(EventPayload::RepartitionDone {
            links_moved: summary.links_moved,
            percent_moved: summary.percent_moved,
        });
        info!(
            partitions = summary.partitions,
            links_moved = summary.links_moved,
            percent_moved = summary.percent_moved,
            "Resharding complete"
        );

        self.replay_backlog().await;
        self.persist().await?;
        Ok(Some(summary))
    }

    /// Apply deferred requests in arrival order.
    ///
    /// Stops re-queuing if one of them triggers another resharding. Failures
    /// keep the failed request and everything after it queued.
    async fn replay_backlog(&mut self) {
        let mut backlog = std::mem::take(&mut self.state.deferred);
        let queued = backlog.len();
        while let Some(request) = backlog.pop_front() {
            if self.state.is_resharding() {
                self.state.deferred.push_back(request);
                continue;
            }
            if let Err(e) = self.apply_train(&request) {
                warn!(error = %e, remaining = backlog.len() + 1, "Failed to replay deferred write");
                self.state.deferred.push_back(request);
                self.state.deferred.extend(backlog);
                break;
            }
            self.history.record(EventPayload::Train {
                tokens: request.tokens,
                tags: request.tags,
            });
            self.maybe_begin_resharding();
        }
        if queued > 0 {
            debug!(queued, requeued = self.state.deferred.len(), "Replayed deferred writes");
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist state after replay");
        }
    }

    /// Generate a sequence using the model's own random source.
    pub fn generate(&mut self, query: &TagQuery, step_limit: usize) -> ChainResult<Vec<Token>> {
        let curve = self.state.options.shift_probabilities.then_some(self.curve);
        let output = walk(
            &self.state,
            &mut self.cache,
            query,
            curve.as_ref(),
            step_limit,
            &mut self.rng,
        )?;
        self.history.record(EventPayload::Generate {
            query: query.clone(),
            output: output.clone(),
        });
        Ok(output)
    }

    /// Generate a sequence drawing from `rng`.
    pub fn generate_with_rng<R: Rng + ?Sized>(
        &mut self,
        query: &TagQuery,
        step_limit: usize,
        rng: &mut R,
    ) -> ChainResult<Vec<Token>> {
        let curve = self.state.options.shift_probabilities.then_some(self.curve);
        let output = walk(&self.state, &mut self.cache, query, curve.as_ref(), step_limit, rng)?;
        self.history.record(EventPayload::Generate {
            query: query.clone(),
            output: output.clone(),
        });
        Ok(output)
    }

    /// Change mutable options. Returns the options now in effect.
    pub async fn configure(&mut self, update: OptionsUpdate) -> ChainResult<ModelOptions> {
        let next = self.state.options.apply(&update)?;
        self.cache.set_idle_timeout(next.partition_idle_timeout);
        self.history.set_enabled(next.store_history.clone());
        self.state.options = next;
        self.maybe_begin_resharding();
        self.persist().await?;
        debug!(options = ?self.state.options, "Reconfigured model");
        Ok(self.state.options.clone())
    }

    /// Every edge stored in partition `id`.
    pub fn dump_partition(&mut self, id: PartitionId) -> ChainResult<Vec<EdgeRecord>> {
        let known = self.state.ring.contains(id)
            || self.state.new_ring.as_ref().is_some_and(|ring| ring.contains(id));
        if !known {
            return Err(ChainError::UnknownPartition(id.0));
        }
        Ok(self.cache.acquire(id)?.records())
    }

    /// Current statistics.
    pub fn stats(&self) -> ModelStats {
        ModelStats {
            order: self.state.options.order,
            partitions: self.state.ring.partition_count(),
            open_partitions: self.cache.open_ids(),
            total_link_count: self.state.total_link_count,
            resharding: self.state.is_resharding(),
            migrated_contexts: self
                .state
                .resharding
                .as_ref()
                .map_or(0, ReshardProgress::migrated_count),
            deferred_writes: self.state.deferred.len(),
            options: self.state.options.clone(),
        }
    }

    /// Close a partition on behalf of its idle worker if it is really idle.
    pub fn handle_idle(&mut self, notice: IdleNotice) {
        if let Err(e) = self.cache.handle_idle(notice) {
            warn!(partition = %notice.partition, error = %e, "Failed to evict idle partition");
        }
    }

    /// Write control state to disk.
    pub async fn persist(&self) -> ChainResult<()> {
        persistence::save(&self.dir, &self.state).await
    }

    /// Persist control state and flush every open partition.
    pub async fn flush(&mut self) -> ChainResult<()> {
        self.persist().await?;
        self.cache.flush_all()?;
        self.history.flush()
    }

    /// Persist control state, then close every partition.
    pub async fn shutdown(&mut self) -> ChainResult<()> {
        self.history.record(EventPayload::End {
            total_link_count: self.state.total_link_count,
        });
        self.persist().await?;
        self.cache.close_all()?;
        self.history.flush()?;
        info!(path = %self.dir.display(), "Model unloaded");
        Ok(())
    }
}

/// Walk the chain from the start context until `End` or `step_limit` draws.
fn walk<R: Rng + ?Sized>(
    state: &ModelState,
    cache: &mut PartitionCache,
    query: &TagQuery,
    curve: Option<&ShiftCurve>,
    step_limit: usize,
    rng: &mut R,
) -> ChainResult<Vec<Token>> {
    query.validate()?;
    let sanitize_tokens = state.options.sanitize_tokens;
    let mut context = Context::start(state.options.order);
    let mut output = Vec::new();

    for _ in 0..step_limit {
        let partition = cache.acquire(state.route(&context))?;
        let Some(edges) = partition.edges(&context) else {
            return Err(ChainError::NoMatchingState { context });
        };
        let candidates = transition::candidates(edges, query, curve);
        let Some(next) = transition::choose(&candidates, rng).cloned() else {
            return Err(ChainError::NoMatchingState { context });
        };
        trace!(context = %context, next = %next, "Generation step");

        if next == Token::End {
            break;
        }
        context.slide(transition::context_token(&next, sanitize_tokens));
        output.push(next);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn words(s: &str) -> Vec<Token> {
        s.split_whitespace().map(Token::text).collect()
    }

    async fn open(dir: &Path, options: ModelOptions) -> Model {
        let (tx, _rx) = mpsc::unbounded_channel();
        Model::open(dir, options, tx).await.unwrap()
    }

    fn seeded() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    async fn finish_resharding(model: &mut Model) -> ReshardSummary {
        for _ in 0..64 {
            if let Some(summary) = model.reshard_step().await.unwrap() {
                return summary;
            }
        }
        panic!("resharding did not finish");
    }

    fn weight_of(model: &mut Model, context: &Context, target: &Token) -> u64 {
        let id = model.state.route(context);
        let partition = model.cache.acquire(id).unwrap();
        partition
            .edges(context)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|((t, _), _)| t == target)
                    .map(|(_, w)| *w)
                    .sum()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_hello_world() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::default()).await;
        let outcome = model.train(words("hello world"), vec![]).await.unwrap();
        assert_eq!(outcome, TrainOutcome::Accepted);
        assert_eq!(model.state().total_link_count, 3);

        let hello = Token::text("hello");
        let world = Token::text("world");
        assert_eq!(weight_of(&mut model, &Context::start(2), &hello), 1);
        assert_eq!(
            weight_of(&mut model, &Context::new(vec![Token::Start, hello.clone()]), &world),
            1
        );
        assert_eq!(
            weight_of(&mut model, &Context::new(vec![hello.clone(), world.clone()]), &Token::End),
            1
        );

        let out = model.generate(&TagQuery::Always, 100).unwrap();
        assert_eq!(out, vec![hello, world]);
    }

    #[tokio::test]
    async fn test_single_path_is_reproduced() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::with_order(1)).await;
        let tokens: Vec<Token> = (0..50).map(Token::Int).collect();
        model.train(tokens.clone(), vec![]).await.unwrap();
        assert_eq!(model.generate(&TagQuery::Always, 1000).unwrap(), tokens);
    }

    #[tokio::test]
    async fn test_step_limit_truncates() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::default()).await;
        model.train(words("one two three"), vec![]).await.unwrap();
        let out = model.generate(&TagQuery::Always, 2).unwrap();
        assert_eq!(out, words("one two"));
    }

    #[tokio::test]
    async fn test_even_split() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::with_order(1)).await;
        model.train(words("x a"), vec![]).await.unwrap();
        model.train(words("x b"), vec![]).await.unwrap();

        let mut rng = seeded();
        let mut a = 0;
        for _ in 0..1000 {
            let out = model.generate_with_rng(&TagQuery::Always, 10, &mut rng).unwrap();
            if out[1] == Token::text("a") {
                a += 1;
            }
        }
        assert!((400..=600).contains(&a), "a drawn {} times", a);
    }

    #[tokio::test]
    async fn test_score_doubles_weight() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::with_order(1)).await;
        model.train(words("a"), vec![Tag::symbol("t1")]).await.unwrap();
        model.train(words("b"), vec![Tag::symbol("t2")]).await.unwrap();

        let query = TagQuery::score(TagQuery::Always, vec![(TagQuery::tag("t1"), 1)]);
        let mut rng = seeded();
        let mut a = 0u32;
        let trials = 3000;
        for _ in 0..trials {
            let out = model.generate_with_rng(&query, 10, &mut rng).unwrap();
            if out[0] == Token::text("a") {
                a += 1;
            }
        }
        let ratio = f64::from(a) / f64::from(trials - a);
        assert!((1.7..2.3).contains(&ratio), "ratio {}", ratio);
    }

    #[tokio::test]
    async fn test_tag_filter_excludes_edges() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::with_order(1)).await;
        model.train(words("cat"), vec![Tag::symbol("noun")]).await.unwrap();
        model.train(words("run"), vec![Tag::symbol("verb")]).await.unwrap();

        for _ in 0..20 {
            let out = model.generate(&TagQuery::tag("noun"), 10).unwrap();
            assert_eq!(out, words("cat"));
        }
    }

    #[tokio::test]
    async fn test_unknown_context_is_no_matching_state() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::default()).await;
        let result = model.generate(&TagQuery::Always, 10);
        assert!(matches!(result, Err(ChainError::NoMatchingState { .. })));

        // Nothing matches :missing, so the walk has no candidates
        model.train(words("a"), vec![]).await.unwrap();
        let result = model.generate(&TagQuery::tag("missing"), 10);
        assert!(matches!(result, Err(ChainError::NoMatchingState { .. })));
    }

    #[tokio::test]
    async fn test_configure_rejects_immutable_changes() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::default()).await;
        let result = model
            .configure(OptionsUpdate {
                order: Some(3),
                ..OptionsUpdate::default()
            })
            .await;
        assert!(matches!(result, Err(ChainError::ConfigurationConflict { .. })));
        assert_eq!(model.state().options.order, 2);

        let options = model
            .configure(OptionsUpdate {
                shift_probabilities: Some(true),
                ..OptionsUpdate::default()
            })
            .await
            .unwrap();
        assert!(options.shift_probabilities);
    }

    #[tokio::test]
    async fn test_reload_keeps_edges_and_counter() {
        let dir = TempDir::new().unwrap();
        {
            let mut model = open(dir.path(), ModelOptions::default()).await;
            model.train(words("hello world"), vec![]).await.unwrap();
            model.shutdown().await.unwrap();
        }
        let mut model = open(dir.path(), ModelOptions::default()).await;
        assert_eq!(model.state().total_link_count, 3);
        assert!(model.stats().open_partitions.is_empty());
        assert_eq!(model.generate(&TagQuery::Always, 10).unwrap(), words("hello world"));
    }

    #[tokio::test]
    async fn test_reload_with_conflicting_order_fails() {
        let dir = TempDir::new().unwrap();
        {
            let mut model = open(dir.path(), ModelOptions::with_order(2)).await;
            model.shutdown().await.unwrap();
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Model::open(dir.path(), ModelOptions::with_order(3), tx).await;
        assert!(matches!(result, Err(ChainError::ConfigurationConflict { .. })));
    }

    fn sequence(i: i64) -> Vec<Token> {
        vec![Token::Int(i * 10), Token::Int(i * 10 + 1), Token::Int(i * 10 + 2)]
    }

    #[tokio::test]
    async fn test_resharding_preserves_edges_and_replays_backlog() {
        let dir = TempDir::new().unwrap();
        let options = ModelOptions::default().partition_size(10);
        let mut model = open(dir.path(), options).await;

        // 4 windows per sequence; the third pushes the count to 12 > 10
        for i in 0..3 {
            let outcome = model.train(sequence(i), vec![]).await.unwrap();
            assert_eq!(outcome, TrainOutcome::Accepted);
        }
        assert!(model.is_resharding());

        let outcome = model.train(sequence(3), vec![]).await.unwrap();
        assert_eq!(outcome, TrainOutcome::Deferred);
        assert_eq!(model.stats().deferred_writes, 1);

        let summary = finish_resharding(&mut model).await;
        assert_eq!(summary.partitions, 2);
        assert!(!model.is_resharding());
        assert_eq!(model.stats().deferred_writes, 0);
        assert_eq!(model.state().total_link_count, 16);

        let order = model.state().options.order;
        for i in 0..4 {
            for (context, target) in transition::windows(order, &sequence(i), true) {
                let expected = if context == Context::start(order) { 4 } else { 1 };
                assert_eq!(weight_of(&mut model, &context, &target), 1);
                let home = model.state().ring.locate(&context);
                let total: u64 = model
                    .dump_partition(home)
                    .unwrap()
                    .iter()
                    .filter(|r| r.context == context)
                    .map(|r| r.weight)
                    .sum();
                assert_eq!(total, expected);
            }
        }

        let stored: u64 = (0..2)
            .map(|id| {
                model
                    .dump_partition(PartitionId(id))
                    .unwrap()
                    .iter()
                    .map(|r| r.weight)
                    .sum::<u64>()
            })
            .sum();
        assert_eq!(stored, 16);
    }

    #[tokio::test]
    async fn test_reads_during_resharding_see_every_edge() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::with_order(1).partition_size(4)).await;
        let tokens: Vec<Token> = (0..20).map(Token::Int).collect();
        model.train(tokens.clone(), vec![]).await.unwrap();
        assert!(model.is_resharding());

        // Before, during and after the scan the single path stays intact
        assert_eq!(model.generate(&TagQuery::Always, 100).unwrap(), tokens);
        model.reshard_step().await.unwrap();
        assert_eq!(model.generate(&TagQuery::Always, 100).unwrap(), tokens);
        finish_resharding(&mut model).await;
        assert_eq!(model.generate(&TagQuery::Always, 100).unwrap(), tokens);
    }

    #[tokio::test]
    async fn test_resharding_resumes_after_reload() {
        let dir = TempDir::new().unwrap();
        let options = ModelOptions::with_order(1).partition_size(4);
        let tokens: Vec<Token> = (0..20).map(Token::Int).collect();
        {
            let mut model = open(dir.path(), options.clone()).await;
            model.train(tokens.clone(), vec![]).await.unwrap();
            model.reshard_step().await.unwrap();
            assert_eq!(
                model.train(words("late"), vec![]).await.unwrap(),
                TrainOutcome::Deferred
            );
            model.shutdown().await.unwrap();
        }

        let mut model = open(dir.path(), options).await;
        assert!(model.is_resharding());
        assert_eq!(model.stats().deferred_writes, 1);
        finish_resharding(&mut model).await;

        assert_eq!(model.state().ring.partition_count(), 2);
        assert_eq!(model.state().total_link_count, 23);
        assert_eq!(
            weight_of(&mut model, &Context::new(vec![Token::text("late")]), &Token::End),
            1
        );
    }

    #[tokio::test]
    async fn test_dump_unknown_partition() {
        let dir = TempDir::new().unwrap();
        let mut model = open(dir.path(), ModelOptions::default()).await;
        assert!(matches!(
            model.dump_partition(PartitionId(5)),
            Err(ChainError::UnknownPartition(5))
        ));
        assert!(model.dump_partition(PartitionId(0)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_records_enabled_events() {
        let dir = TempDir::new().unwrap();
        let options = ModelOptions::default().history([
            crate::history::EventKind::Start,
            crate::history::EventKind::Train,
            crate::history::EventKind::End,
        ]);
        {
            let mut model = open(dir.path(), options).await;
            model.train(words("a b"), vec![]).await.unwrap();
            model.generate(&TagQuery::Always, 10).unwrap();
            model.shutdown().await.unwrap();
        }
        let records = crate::history::read_records(&dir.path().join(HISTORY_FILE)).unwrap();
        let kinds: Vec<_> = records.iter().map(|r| r.event_kind).collect();
        assert_eq!(
            kinds,
            vec![
                crate::history::EventKind::Start,
                crate::history::EventKind::Train,
                crate::history::EventKind::End,
            ]
        );
    }
}
