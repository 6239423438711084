//! Pipeline orchestrator.
//!
//! One run streams through three stages:
//!
//! 1. the fetch coordinator (its own thread, one worker per provider)
//!    discovers candidates,
//! 2. a dispatcher skips already-cataloged ids and hands the rest to a rayon
//!    pool that downloads and inspects them in parallel,
//! 3. the persisting loop on the calling thread admits, stores and inserts
//!    results one at a time.
//!
//! Only the persisting loop writes. After cancellation it keeps accepting
//! results for the grace period, then returns without waiting for the other
//! stages.
//!
//! Per-candidate problems are counted and logged; only catalog loss at start,
//! an empty provider set or every provider being unreachable fails a run.

use anyhow::{bail, Result};
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, InsertOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, RateLimitConfig};
use crate::coordinator::{CoordinatorReport, FetchCoordinator, ProviderPlan};
use crate::error::{DuplicateError, FetchError, PipelineError, Rejection, StorageError};
use crate::fetcher::ContentFetcher;
use crate::http::{Transport, UreqTransport};
use crate::model::{new_record_id, CandidateImage, ImageContent, ImageRecord, Label, RunCounters, RunSummary};
use crate::quality::{Inspection, NearDuplicateIndex, QualityGate};
use crate::rate_limit::RateLimiters;
use crate::retry::RetryPolicy;
use crate::sources::{create_adapter, SourceAdapter};
use crate::storage::BlobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Validating,
    Persisting,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Validating => "validating",
            RunState::Persisting => "persisting",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Validating)
                | (Validating, Persisting)
                | (Persisting, Completed)
                | (Idle | Fetching | Validating | Persisting, Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one run; transitions are checked.
#[derive(Debug)]
struct RunTracker {
    run_id: String,
    state: RunState,
}

impl RunTracker {
    fn advance(&mut self, next: RunState) {
        if self.state == next {
            return;
        }
        if self.state.can_transition_to(next) {
            debug!(run_id = %self.run_id, from = %self.state, to = %next, "Run state change");
            self.state = next;
        } else {
            warn!(run_id = %self.run_id, from = %self.state, to = %next, "Ignoring invalid run state change");
        }
    }

    /// Walk forward through intermediate stages to `target`.
    fn advance_to(&mut self, target: RunState) {
        const ORDER: [RunState; 5] = [
            RunState::Idle,
            RunState::Fetching,
            RunState::Validating,
            RunState::Persisting,
            RunState::Completed,
        ];
        let Some(goal) = ORDER.iter().position(|s| *s == target) else {
            self.advance(target);
            return;
        };
        while let Some(current) = ORDER.iter().position(|s| *s == self.state) {
            if current >= goal {
                break;
            }
            self.advance(ORDER[current + 1]);
        }
    }
}

/// One provider to search in a run.
pub struct ProviderSource {
    pub adapter: Arc<dyn SourceAdapter>,
    pub queries: Vec<String>,
    /// Falls back to the global `[rate_limit]` when unset.
    pub rate_limit: Option<RateLimitConfig>,
}

/// Build sources from configuration.
///
/// `only` restricts to the named providers; an explicitly named provider
/// without an API key is an error, other keyless providers are skipped.
/// `queries`, when non-empty, replaces each provider's configured queries.
pub fn build_sources(
    config: &Config,
    transport: Arc<dyn Transport>,
    only: &[String],
    queries: &[String],
) -> Result<Vec<ProviderSource>> {
    for name in only {
        if !config.providers.iter().any(|p| p.name() == name.to_lowercase()) {
            bail!("Unknown or unconfigured provider: {}", name);
        }
    }

    let mut sources = Vec::new();
    for provider in &config.providers {
        let selected = only.iter().any(|n| n.to_lowercase() == provider.name());
        if !only.is_empty() && !selected {
            continue;
        }
        if only.is_empty() && !provider.enabled {
            continue;
        }

        let adapter = match create_adapter(provider, transport.clone()) {
            Ok(adapter) => adapter,
            Err(e) if !selected => {
                warn!(provider = provider.name(), error = %e, "Skipping provider");
                continue;
            }
            Err(e) => return Err(e),
        };

        sources.push(ProviderSource {
            adapter: Arc::from(adapter),
            queries: if queries.is_empty() {
                provider.queries.clone()
            } else {
                queries.to_vec()
            },
            rate_limit: provider.rate_limit.clone(),
        });
    }
    Ok(sources)
}

/// Result of downloading and inspecting one candidate on the worker pool.
enum Inspected {
    Ready {
        candidate: CandidateImage,
        content: ImageContent,
        inspection: Inspection,
    },
    Rejected {
        candidate: CandidateImage,
        rejection: Rejection,
    },
    /// Cancelled before the download started.
    Abandoned,
}

pub struct Pipeline {
    config: Config,
    catalog: Arc<Catalog>,
    blobs: BlobStore,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(config: Config, catalog: Arc<Catalog>, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        let blobs = BlobStore::new(config.data_dir.clone());
        Self {
            config,
            catalog,
            blobs,
            transport,
            clock,
        }
    }

    /// Open the configured catalog and wire up the real HTTP transport.
    pub fn open(config: Config) -> Result<Self, PipelineError> {
        let busy_timeout = Duration::from_millis(config.pipeline.catalog_busy_timeout_ms);
        let catalog =
            Catalog::open_with_busy_timeout(&config.db_path, busy_timeout).map_err(PipelineError::CatalogUnavailable)?;
        let transport = Arc::new(UreqTransport::new(Duration::from_secs(config.fetcher.timeout_secs)));
        Ok(Self::new(config, Arc::new(catalog), transport, Arc::new(SystemClock::new())))
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute one ingestion run.
    pub fn run(&self, sources: Vec<ProviderSource>, cancel: Arc<AtomicBool>) -> Result<RunSummary, PipelineError> {
        let counters = Arc::new(RunCounters::new());
        let mut tracker = RunTracker {
            run_id: new_record_id(),
            state: RunState::Idle,
        };
        let started_at = Utc::now();
        info!(run_id = %tracker.run_id, providers = sources.len(), "Starting ingestion run");

        match self.execute(sources, &cancel, &counters, &mut tracker) {
            Ok(()) => {
                tracker.advance_to(RunState::Completed);
                let summary = RunSummary {
                    run_id: tracker.run_id.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    counts: counters.snapshot(),
                    cancelled: cancel.load(Ordering::SeqCst),
                };
                if let Err(e) = self.catalog.record_run(&summary, tracker.state.as_str(), None) {
                    warn!(run_id = %summary.run_id, error = %e, "Failed to record run");
                }
                info!("{}", summary);
                Ok(summary)
            }
            Err(err) => {
                tracker.advance(RunState::Failed);
                let summary = RunSummary {
                    run_id: tracker.run_id.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    counts: counters.snapshot(),
                    cancelled: cancel.load(Ordering::SeqCst),
                };
                let message = err.to_string();
                if let Err(e) = self.catalog.record_run(&summary, tracker.state.as_str(), Some(&message)) {
                    debug!(run_id = %summary.run_id, error = %e, "Failed run could not be recorded");
                }
                tracing::error!(run_id = %summary.run_id, error = %message, "Run failed");
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        sources: Vec<ProviderSource>,
        cancel: &Arc<AtomicBool>,
        counters: &Arc<RunCounters>,
        tracker: &mut RunTracker,
    ) -> Result<(), PipelineError> {
        if sources.is_empty() {
            return Err(PipelineError::NoProviders);
        }
        self.catalog.ping().map_err(PipelineError::CatalogUnavailable)?;
        let mut index = NearDuplicateIndex::from_entries(
            self.catalog
                .perceptual_hashes()
                .map_err(PipelineError::CatalogUnavailable)?,
        );
        debug!(hashes = index.len(), "Near-duplicate index seeded");

        // Limiters live for exactly this run.
        let mut limiters = RateLimiters::new(self.config.rate_limit.clone(), self.clock.clone());
        let plans: Vec<ProviderPlan> = sources
            .into_iter()
            .map(|source| ProviderPlan {
                limiter: limiters.register(source.adapter.provider(), source.rate_limit.as_ref()),
                adapter: source.adapter,
                queries: source.queries,
            })
            .collect();
        let limiters = Arc::new(limiters);

        let retry = RetryPolicy::from_config(&self.config.retry);
        let coordinator = FetchCoordinator::new(
            plans,
            retry.clone(),
            self.clock.clone(),
            self.config.pipeline.max_results_per_query,
            self.config.pipeline.max_consecutive_page_failures,
        );
        info!(providers = ?coordinator.providers(), "Searching providers");
        let fetcher = Arc::new(ContentFetcher::new(
            &self.config.fetcher,
            self.transport.clone(),
            limiters,
            retry.clone(),
            self.clock.clone(),
        ));
        let gate = Arc::new(QualityGate::new(self.config.quality.clone()));

        let pool_size = self.config.pipeline.worker_pool_size.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("fretlog-worker-{}", i))
            .build()
            .map_err(|e| PipelineError::Worker(e.to_string()))?;

        let (candidate_tx, candidate_rx) = mpsc::sync_channel::<CandidateImage>(pool_size * 4);
        let (result_tx, result_rx) = mpsc::sync_channel::<Inspected>(pool_size * 2);
        let discovery_done = Arc::new(AtomicBool::new(false));

        tracker.advance(RunState::Fetching);

        // Discovery and download threads are not joined on cancellation: once
        // the grace period is over they are left to wind down on their own,
        // and nothing they produce afterwards reaches the catalog.
        let discovery = {
            let counters = counters.clone();
            let cancel = cancel.clone();
            let discovery_done = discovery_done.clone();
            std::thread::Builder::new()
                .name("fretlog-discovery".to_string())
                .spawn(move || {
                    let report = coordinator.run(&counters, &cancel, |candidate| candidate_tx.send(candidate).is_ok());
                    drop(candidate_tx);
                    discovery_done.store(true, Ordering::SeqCst);
                    report
                })
                .map_err(|e| PipelineError::Worker(e.to_string()))?
        };

        {
            let counters = counters.clone();
            let cancel = cancel.clone();
            let catalog = self.catalog.clone();
            let gate = gate.clone();
            std::thread::Builder::new()
                .name("fretlog-dispatch".to_string())
                .spawn(move || {
                    for candidate in candidate_rx {
                        if cancel.load(Ordering::SeqCst) {
                            continue;
                        }
                        counters.fetched();
                        if already_cataloged(&catalog, &candidate) {
                            counters.rejected(&Rejection::Duplicate(DuplicateError::AlreadyCataloged {
                                provider: candidate.provider,
                                provider_native_id: candidate.provider_native_id,
                            }));
                            continue;
                        }

                        let result_tx: SyncSender<Inspected> = result_tx.clone();
                        let fetcher = fetcher.clone();
                        let gate = gate.clone();
                        let cancel = cancel.clone();
                        pool.spawn(move || {
                            let outcome = download_and_inspect(&fetcher, &gate, candidate, &cancel);
                            let _ = result_tx.send(outcome);
                        });
                    }
                    // Dropping the pool does not wait for queued downloads.
                    drop(result_tx);
                })
                .map_err(|e| PipelineError::Worker(e.to_string()))?;
        }

        let drained = self.persist_results(result_rx, &gate, &mut index, &retry, cancel, counters, tracker, &discovery_done);
        if !drained {
            return Ok(());
        }

        let report: CoordinatorReport = discovery
            .join()
            .map_err(|_| PipelineError::Worker("fetch coordinator panicked".to_string()))?;

        if report.all_unreachable() && !cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::AllProvidersUnreachable {
                failed_pages: report.pages_failed,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_results(
        &self,
        results: mpsc::Receiver<Inspected>,
        gate: &QualityGate,
        index: &mut NearDuplicateIndex,
        retry: &RetryPolicy,
        cancel: &AtomicBool,
        counters: &RunCounters,
        tracker: &mut RunTracker,
        discovery_done: &AtomicBool,
    ) -> bool {
        let grace = Duration::from_secs(self.config.pipeline.cancel_grace_secs);
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if cancel.load(Ordering::SeqCst) && drain_deadline.is_none() {
                info!(grace_secs = grace.as_secs(), "Cancellation requested, draining in-flight downloads");
                drain_deadline = Some(Instant::now() + grace);
            }
            if drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Grace period elapsed, abandoning remaining in-flight downloads");
                return false;
            }
            if discovery_done.load(Ordering::SeqCst) {
                tracker.advance(RunState::Validating);
            }

            match results.recv_timeout(Duration::from_millis(100)) {
                Ok(Inspected::Ready {
                    candidate,
                    content,
                    inspection,
                }) => {
                    self.persist_one(candidate, content, inspection, gate, index, retry, counters);
                }
                Ok(Inspected::Rejected { candidate, rejection }) => {
                    debug!(
                        provider = %candidate.provider,
                        id = %candidate.provider_native_id,
                        reason = %rejection,
                        "Candidate rejected"
                    );
                    counters.rejected(&rejection);
                }
                Ok(Inspected::Abandoned) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracker.advance_to(RunState::Persisting);
                    return true;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn persist_one(
        &self,
        candidate: CandidateImage,
        content: ImageContent,
        inspection: Inspection,
        gate: &QualityGate,
        index: &mut NearDuplicateIndex,
        retry: &RetryPolicy,
        counters: &RunCounters,
    ) {
        if let Err(rejection) = gate.admit(&inspection, &self.catalog, index) {
            debug!(
                provider = %candidate.provider,
                id = %candidate.provider_native_id,
                reason = %rejection,
                "Candidate rejected"
            );
            counters.rejected(&rejection);
            return;
        }

        let storage_path = match self
            .blobs
            .put(&inspection.content_hash, &content.content_type, &content.bytes)
        {
            Ok(path) => path,
            Err(e) => {
                warn!(id = %candidate.provider_native_id, error = %e, "Failed to store image bytes");
                counters.rejected(&Rejection::from(e));
                return;
            }
        };

        let record = ImageRecord {
            record_id: new_record_id(),
            provider: candidate.provider,
            provider_native_id: candidate.provider_native_id,
            content_hash: inspection.content_hash,
            perceptual_hash: inspection.perceptual_hash,
            storage_path,
            width: inspection.width,
            height: inspection.height,
            label: Label::Unknown,
            quality_flags: inspection.flags,
            ingested_at: Utc::now(),
            source_url: Some(candidate.source_url),
            content_type: Some(content.content_type),
            byte_size: Some(content.byte_len as u64),
            search_query: Some(candidate.search_query),
            query_tags: candidate.query_tags,
        };

        let inserted = retry.run(
            self.clock.as_ref(),
            None,
            |_| self.catalog.insert_if_absent(&record),
            StorageError::is_transient,
        );

        match inserted {
            Ok(InsertOutcome::Inserted) => {
                index.insert(&record.record_id, &record.perceptual_hash);
                counters.accepted();
                info!(
                    record_id = %record.record_id,
                    provider = %record.provider,
                    id = %record.provider_native_id,
                    width = record.width,
                    height = record.height,
                    "Cataloged image"
                );
            }
            Ok(InsertOutcome::AlreadyPresent) => {
                debug!(provider = %record.provider, id = %record.provider_native_id, "Already present");
                counters.rejected(&Rejection::Duplicate(DuplicateError::AlreadyCataloged {
                    provider: record.provider.clone(),
                    provider_native_id: record.provider_native_id.clone(),
                }));
                self.discard_orphan_blob(&record);
            }
            Err(e) => {
                warn!(record_id = %record.record_id, error = %e, "Catalog insert failed");
                counters.rejected(&Rejection::from(e));
                self.discard_orphan_blob(&record);
            }
        }
    }

    /// Remove a freshly written blob whose bytes ended up in no record.
    fn discard_orphan_blob(&self, record: &ImageRecord) {
        if let Ok(false) = self.catalog.contains_content_hash(&record.content_hash) {
            if let Err(e) = self.blobs.remove(&record.storage_path) {
                debug!(path = %record.storage_path, error = %e, "Could not remove orphan blob");
            }
        }
    }
}

fn already_cataloged(catalog: &Catalog, candidate: &CandidateImage) -> bool {
    match catalog.contains_native(&candidate.provider, &candidate.provider_native_id) {
        Ok(found) => {
            if found {
                debug!(
                    provider = %candidate.provider,
                    id = %candidate.provider_native_id,
                    "Already cataloged, skipping download"
                );
            }
            found
        }
        Err(e) => {
            // the insert constraint still catches it
            warn!(error = %e, "Catalog pre-check failed");
            false
        }
    }
}

fn download_and_inspect(
    fetcher: &ContentFetcher,
    gate: &QualityGate,
    candidate: CandidateImage,
    cancel: &AtomicBool,
) -> Inspected {
    if cancel.load(Ordering::SeqCst) {
        return Inspected::Abandoned;
    }

    let content = match fetcher.fetch(&candidate, cancel) {
        Ok(content) => content,
        Err(FetchError::Cancelled) => return Inspected::Abandoned,
        Err(e) => {
            if !matches!(e, FetchError::Invalid(_)) {
                warn!(url = %candidate.source_url, error = %e, "Download failed");
            }
            return Inspected::Rejected {
                candidate,
                rejection: e.into(),
            };
        }
    };

    match gate.inspect(&candidate, &content) {
        Ok(inspection) => Inspected::Ready {
            candidate,
            content,
            inspection,
        },
        Err(e) => Inspected::Rejected {
            candidate,
            rejection: e.into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::catalog::RecordFilter;
    use crate::config::{ProviderConfig, ProviderKind};
    use crate::quality::hashing;
    use crate::testing::{block_image, brighten, candidate, png_bytes, jpeg_bytes, ScriptedAdapter, ScriptedTransport};
    use std::collections::HashSet;

    struct Harness {
        _dir: tempfile::TempDir,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
        pipeline: Pipeline,
    }

    fn harness() -> Harness {
        harness_with(ScriptedTransport::new(), 1)
    }

    fn harness_with(transport: ScriptedTransport, cancel_grace_secs: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.db_path = dir.path().join("catalog.db");
        config.data_dir = dir.path().join("data");
        config.pipeline.worker_pool_size = 3;
        config.pipeline.cancel_grace_secs = cancel_grace_secs;
        config.rate_limit = RateLimitConfig {
            requests_per_second: 50.0,
            burst: 10,
        };
        config.retry.jitter = 0.0;

        let catalog = Arc::new(Catalog::open_with_busy_timeout(&config.db_path, Duration::from_millis(50)).unwrap());
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new());
        let pipeline = Pipeline::new(config, catalog, transport.clone(), clock.clone());
        Harness {
            _dir: dir,
            transport,
            clock,
            pipeline,
        }
    }

    /// Sets `cancel` after `delay` of wall time.
    fn cancel_after(cancel: &Arc<AtomicBool>, delay: Duration) -> std::thread::JoinHandle<()> {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            cancel.store(true, Ordering::SeqCst);
        })
    }

    fn url(provider: &str, id: usize) -> String {
        format!("https://cdn.test/{}/{}", provider, id)
    }

    /// Five candidates for `provider`, each backed by a distinct image unless
    /// its index is in `custom`, in which case the caller scripts the download.
    fn provider_with_images(
        h: &Harness,
        provider: &str,
        seed_base: u64,
        custom: &[usize],
    ) -> (Arc<ScriptedAdapter>, Vec<Vec<u8>>) {
        let mut candidates = Vec::new();
        let mut bodies = Vec::new();
        for i in 0..5 {
            let bytes = png_bytes(&block_image(seed_base + i as u64, 320 + i as u32 * 10, 240));
            if !custom.contains(&i) {
                h.transport.push_image(&url(provider, i), bytes.clone(), Some("image/png"));
            }
            candidates.push(candidate(provider, &i.to_string(), &url(provider, i)));
            bodies.push(bytes);
        }
        let adapter = Arc::new(ScriptedAdapter::new(provider).with_candidates("guitar", candidates));
        (adapter, bodies)
    }

    fn source(adapter: Arc<ScriptedAdapter>) -> ProviderSource {
        ProviderSource {
            adapter,
            queries: vec!["guitar".to_string()],
            rate_limit: None,
        }
    }

    fn seed_record(catalog: &Catalog, bytes: &[u8]) {
        let img = image::load_from_memory(bytes).unwrap();
        let record = ImageRecord {
            record_id: new_record_id(),
            provider: "legacy".to_string(),
            provider_native_id: "seed".to_string(),
            content_hash: hashing::content_hash(bytes),
            perceptual_hash: hashing::perceptual_hash(&img, 8).unwrap(),
            storage_path: "blobs/seed.png".to_string(),
            width: img.width(),
            height: img.height(),
            label: Label::Electric,
            quality_flags: Vec::new(),
            ingested_at: Utc::now(),
            source_url: None,
            content_type: None,
            byte_size: None,
            search_query: None,
            query_tags: Vec::new(),
        };
        catalog.insert_if_absent(&record).unwrap();
    }

    #[test]
    fn test_state_transitions() {
        use RunState::*;
        assert!(Idle.can_transition_to(Fetching));
        assert!(Persisting.can_transition_to(Completed));
        assert!(Validating.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Fetching));

        let mut tracker = RunTracker {
            run_id: "r".to_string(),
            state: Idle,
        };
        tracker.advance_to(Completed);
        assert_eq!(tracker.state, Completed);
        tracker.advance(Failed);
        assert_eq!(tracker.state, Completed);
    }

    #[test]
    fn test_end_to_end_two_providers() {
        let h = harness();
        let (pixabay, _) = provider_with_images(&h, "pixabay", 100, &[4]);
        let (pexels, pexels_bodies) = provider_with_images(&h, "pexels", 200, &[]);

        // one corrupt download, one exact copy of an already-cataloged image
        h.transport.push(
            &url("pixabay", 4),
            Ok(crate::http::HttpResponse {
                status: 200,
                content_type: Some("image/jpeg".to_string()),
                body: b"\xff\xd8\xff\xe0 truncated".to_vec(),
            }),
        );
        let catalog = h.pipeline.catalog().clone();
        seed_record(&catalog, &pexels_bodies[2]);
        let before = catalog.count(&RecordFilter::default()).unwrap();

        let summary = h
            .pipeline
            .run(vec![source(pixabay), source(pexels)], Arc::new(AtomicBool::new(false)))
            .unwrap();

        assert_eq!(summary.counts.fetched, 10);
        assert_eq!(summary.counts.accepted, 8);
        assert_eq!(summary.counts.rejected_quality, 1);
        assert_eq!(summary.counts.rejected_duplicate, 1);
        assert_eq!(summary.counts.rejected_error, 0);
        assert!(!summary.cancelled);
        assert_eq!(catalog.count(&RecordFilter::default()).unwrap(), before + 8);

        let records: Vec<ImageRecord> = catalog
            .query(RecordFilter::default())
            .collect::<Result<_, _>>()
            .unwrap();
        let natives: HashSet<_> = records.iter().map(|r| (&r.provider, &r.provider_native_id)).collect();
        let hashes: HashSet<_> = records.iter().map(|r| &r.content_hash).collect();
        assert_eq!(natives.len(), records.len());
        assert_eq!(hashes.len(), records.len());

        for record in records.iter().filter(|r| r.provider != "legacy") {
            assert_eq!(record.label, Label::Unknown);
            let path = h.pipeline.config().data_dir.join(&record.storage_path);
            let stored = std::fs::read(path).unwrap();
            assert_eq!(hashing::content_hash(&stored), record.content_hash);
        }

        let runs = catalog.recent_runs(1).unwrap();
        assert_eq!(runs[0].state, "completed");
        assert_eq!(runs[0].summary.counts, summary.counts);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let h = harness();
        let (pixabay, _) = provider_with_images(&h, "pixabay", 300, &[]);
        let (unsplash, _) = provider_with_images(&h, "unsplash", 400, &[]);
        let catalog = h.pipeline.catalog().clone();

        let first = h
            .pipeline
            .run(vec![source(pixabay.clone()), source(unsplash.clone())], Arc::new(AtomicBool::new(false)))
            .unwrap();
        assert_eq!(first.counts.accepted, 10);
        let downloads = h.transport.requests().len();

        let second = h
            .pipeline
            .run(vec![source(pixabay), source(unsplash)], Arc::new(AtomicBool::new(false)))
            .unwrap();
        assert_eq!(second.counts.accepted, 0);
        assert_eq!(second.counts.rejected_duplicate, 10);
        assert_eq!(catalog.count(&RecordFilter::default()).unwrap(), 10);
        // cataloged ids are not downloaded again
        assert_eq!(h.transport.requests().len(), downloads);
    }

    #[test]
    fn test_one_failing_download_does_not_stop_the_rest() {
        let h = harness();
        let (pexels, _) = provider_with_images(&h, "pexels", 500, &[1]);
        h.transport.push_transport_error(&url("pexels", 1), "connection reset");

        let summary = h
            .pipeline
            .run(vec![source(pexels)], Arc::new(AtomicBool::new(false)))
            .unwrap();

        assert_eq!(summary.counts.fetched, 5);
        assert_eq!(summary.counts.accepted, 4);
        assert_eq!(summary.counts.rejected_error, 1);
    }

    #[test]
    fn test_near_duplicates_within_a_run() {
        let h = harness();
        let original = block_image(600, 400, 300);
        h.transport.push_image(&url("pixabay", 0), png_bytes(&original), Some("image/png"));
        h.transport.push_image(&url("pixabay", 1), png_bytes(&brighten(&original, 3)), Some("image/png"));
        h.transport.push_image(&url("pixabay", 2), jpeg_bytes(&block_image(601, 400, 300)), Some("image/jpeg"));

        let adapter = Arc::new(ScriptedAdapter::new("pixabay").with_candidates(
            "guitar",
            (0..3).map(|i| candidate("pixabay", &i.to_string(), &url("pixabay", i))).collect(),
        ));
        let summary = h
            .pipeline
            .run(vec![source(adapter)], Arc::new(AtomicBool::new(false)))
            .unwrap();

        assert_eq!(summary.counts.accepted, 2);
        assert_eq!(summary.counts.rejected_duplicate, 1);
    }

    #[test]
    fn test_all_providers_unreachable_fails_run() {
        let h = harness();
        let adapter = Arc::new(ScriptedAdapter::new("pixabay"));
        for token in [None, Some("2"), Some("3")] {
            adapter.push_page(
                "guitar",
                token,
                Err(crate::error::ProviderError::transport("pixabay", "dns failure")),
            );
        }

        let err = h
            .pipeline
            .run(vec![source(adapter)], Arc::new(AtomicBool::new(false)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::AllProvidersUnreachable { failed_pages: 3 }));

        let runs = h.pipeline.catalog().recent_runs(1).unwrap();
        assert_eq!(runs[0].state, "failed");
        assert!(runs[0].error_message.is_some());
    }

    #[test]
    fn test_no_providers_fails_run() {
        let h = harness();
        let err = h.pipeline.run(Vec::new(), Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(matches!(err, PipelineError::NoProviders));
    }

    #[test]
    fn test_unopenable_catalog_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        // a directory cannot be opened as a database file
        config.db_path = dir.path().to_path_buf();
        assert!(matches!(
            Pipeline::open(config),
            Err(PipelineError::CatalogUnavailable(_))
        ));
    }

    #[test]
    fn test_cancelled_run_completes_cleanly() {
        let h = harness();
        let (pixabay, _) = provider_with_images(&h, "pixabay", 700, &[]);

        let summary = h
            .pipeline
            .run(vec![source(pixabay.clone())], Arc::new(AtomicBool::new(true)))
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.counts.accepted, 0);
        assert!(pixabay.calls().is_empty());
        assert_eq!(h.pipeline.catalog().recent_runs(1).unwrap()[0].state, "completed");
    }

    #[test]
    fn test_cancel_mid_download_returns_after_grace() {
        let h = harness_with(ScriptedTransport::new().with_latency(Duration::from_secs(5)), 1);
        let (pixabay, _) = provider_with_images(&h, "pixabay", 800, &[]);
        let cancel = Arc::new(AtomicBool::new(false));
        let canceller = cancel_after(&cancel, Duration::from_millis(200));

        let started = Instant::now();
        let summary = h.pipeline.run(vec![source(pixabay)], cancel.clone()).unwrap();
        let elapsed = started.elapsed();
        canceller.join().unwrap();

        // downloads are still stuck in the transport; the run does not wait for them
        assert!(elapsed < Duration::from_secs(3), "run took {:?}", elapsed);
        assert!(summary.cancelled);
        assert_eq!(summary.counts.accepted, 0);
        assert_eq!(h.pipeline.catalog().count(&RecordFilter::default()).unwrap(), 0);
        assert_eq!(h.pipeline.catalog().recent_runs(1).unwrap()[0].state, "completed");
    }

    #[test]
    fn test_in_flight_downloads_are_kept_within_grace() {
        let h = harness_with(ScriptedTransport::new().with_latency(Duration::from_millis(300)), 5);
        let (pixabay, _) = provider_with_images(&h, "pixabay", 900, &[]);
        let cancel = Arc::new(AtomicBool::new(false));
        let canceller = cancel_after(&cancel, Duration::from_millis(100));

        let started = Instant::now();
        let summary = h.pipeline.run(vec![source(pixabay)], cancel.clone()).unwrap();
        let elapsed = started.elapsed();
        canceller.join().unwrap();

        // the pool's three in-flight downloads finish and are cataloged; the
        // rest never start
        assert!(summary.cancelled);
        assert!((1..=3).contains(&summary.counts.accepted), "accepted {}", summary.counts.accepted);
        assert_eq!(
            h.pipeline.catalog().count(&RecordFilter::default()).unwrap(),
            summary.counts.accepted
        );
        assert!(h.transport.requests().len() <= 3);
        // drained well before the grace deadline
        assert!(elapsed < Duration::from_secs(3), "run took {:?}", elapsed);
    }

    #[test]
    fn test_busy_catalog_insert_is_retried_then_counted_as_error() {
        let h = harness();
        let bytes = png_bytes(&block_image(1000, 400, 300));
        h.transport.push_image(&url("pexels", 0), bytes, Some("image/png"));
        let adapter = Arc::new(
            ScriptedAdapter::new("pexels").with_candidates("guitar", vec![candidate("pexels", "0", &url("pexels", 0))]),
        );

        // a second writer holds the database write lock for the whole run
        let blocker = rusqlite::Connection::open(&h.pipeline.config().db_path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let summary = h
            .pipeline
            .run(vec![source(adapter)], Arc::new(AtomicBool::new(false)))
            .unwrap();
        blocker.execute_batch("ROLLBACK").unwrap();

        assert_eq!(summary.counts.fetched, 1);
        assert_eq!(summary.counts.accepted, 0);
        assert_eq!(summary.counts.rejected_error, 1);
        // three attempts: 500ms then 1s of backoff between them, no third backoff
        let waited = h.clock.now();
        assert!(
            waited >= Duration::from_millis(1500) && waited < Duration::from_millis(2000),
            "backoff {:?}",
            waited
        );
        assert_eq!(h.pipeline.catalog().count(&RecordFilter::default()).unwrap(), 0);
    }

    #[test]
    fn test_build_sources_from_config() {
        let mut config = Config::default();
        let mut pexels = ProviderConfig::new(ProviderKind::Pexels);
        pexels.api_key = Some("pk".to_string());
        let mut unsplash = ProviderConfig::new(ProviderKind::Unsplash);
        unsplash.api_key_env = Some("FRETLOG_TEST_MISSING_UNSPLASH".to_string());
        config.providers = vec![pexels, unsplash];
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new());

        // keyless providers are skipped unless explicitly requested
        let sources = build_sources(&config, transport.clone(), &[], &[]).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].adapter.provider(), "pexels");
        assert_eq!(sources[0].queries.len(), 2);

        let sources = build_sources(&config, transport.clone(), &["Pexels".to_string()], &["telecaster".to_string()]).unwrap();
        assert_eq!(sources[0].queries, vec!["telecaster".to_string()]);

        assert!(build_sources(&config, transport.clone(), &["unsplash".to_string()], &[]).is_err());
        assert!(build_sources(&config, transport, &["flickr".to_string()], &[]).is_err());
    }
}
