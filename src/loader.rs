use crate::checkpoint::{
    CheckpointCounters, CheckpointManager, CheckpointStore, InputFingerprint, Progress, RecentError,
    RunStatus,
};
use crate::config::{CorruptPolicy, LoaderConfig, PROGRESS_INTERVAL};
use crate::dedup::DedupIndex;
use crate::error::{FailureKind, LoadError, SourceError};
use crate::hierarchy::HierarchyGuard;
use crate::models::{HierarchyEdge, NormalizedRecord};
use crate::normalize::{normalize, NormalizeOptions};
use crate::source::SourceReader;
use crate::stats::LoadStats;
use crate::store::GraphStore;
use crate::writer::{BatchWriter, PreparedBatch};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every record was read
    Exhausted,
    MaxBatches,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    /// `None` when the run ended on a fatal error
    pub stop: Option<StopReason>,
    pub status: RunStatus,
    /// Offset the next run resumes from
    pub offset: u64,
    pub resumed_from: Option<u64>,
    pub batches_this_run: u64,
    pub batches_completed: u64,
    pub counters: CheckpointCounters,
    pub recent_errors: Vec<RecentError>,
    /// PART_OF edges whose parent never appeared
    pub unresolved_hierarchy: Vec<HierarchyEdge>,
    pub elapsed: Duration,
}

/// Problems seen while filling a batch; applied once the batch is settled so a
/// fatal error leaves the counters matching the checkpointed offset.
#[derive(Default)]
struct BatchIssues {
    invalid: u64,
    corrupt: u64,
    errors: Vec<RecentError>,
}

/// Drives read → normalize → dedup → write → checkpoint, one batch at a time.
pub struct Loader {
    config: LoaderConfig,
    store: Arc<dyn GraphStore>,
    source: SourceReader,
    checkpoints: CheckpointManager,
    dedup: DedupIndex,
    hierarchy: HierarchyGuard,
    writer: BatchWriter,
    stats: LoadStats,
    normalize: NormalizeOptions,
    cancel: Arc<AtomicBool>,
    offset: u64,
    resumed_from: Option<u64>,
    batches_this_run: u64,
    exhausted: bool,
    started: Instant,
    progress: ProgressBar,
}

impl Loader {
    /// Validate the configuration, restore the checkpoint, position the source
    /// and snapshot existing identities. The caller owns closing the store if
    /// this fails.
    pub async fn open(
        source_path: &Path,
        config: LoaderConfig,
        store: Arc<dyn GraphStore>,
        checkpoint_store: Box<dyn CheckpointStore>,
    ) -> Result<Self, LoadError> {
        config.validate()?;

        let fingerprint = InputFingerprint::of(source_path)
            .map_err(|e| LoadError::Source(io::Error::other(format!("{e:#}"))))?;
        let mut checkpoints = CheckpointManager::new(
            checkpoint_store,
            fingerprint,
            config.checkpoint_every,
            config.recent_errors_limit,
        );
        let restored = checkpoints.restore();

        let mut source = SourceReader::open(source_path, config.format).map_err(fatal_source)?;
        let (stats, offset, hierarchy, resumed_from) = match restored {
            Some(cp) => {
                let skipped = source.skip_to(cp.offset).map_err(fatal_source)?;
                if skipped < cp.offset {
                    warn!(
                        checkpoint_offset = cp.offset,
                        records = skipped,
                        "Source ends before the checkpoint offset"
                    );
                }
                info!(
                    offset = cp.offset,
                    batches = cp.batches_completed,
                    pending_edges = cp.pending_hierarchy.len(),
                    "Resuming from checkpoint"
                );
                (
                    LoadStats::from_checkpoint(&cp.counters, cp.batches_completed),
                    cp.offset,
                    HierarchyGuard::with_pending(cp.pending_hierarchy),
                    Some(cp.offset),
                )
            }
            None => {
                info!(
                    checkpoint = %checkpoints.describe(),
                    "No checkpoint to resume, starting at offset 0"
                );
                (LoadStats::new(), 0, HierarchyGuard::new(), None)
            }
        };

        store.ping().await.map_err(|source| LoadError::ConnectionFatal {
            attempts: 1,
            source,
        })?;
        let dedup = DedupIndex::bootstrap(store.as_ref(), config.display_name_fallback)
            .await
            .map_err(|source| LoadError::ConnectionFatal {
                attempts: 1,
                source,
            })?;

        checkpoints
            .start(Progress {
                offset,
                batches_completed: stats.batches(),
                counters: stats.to_checkpoint(),
                pending_hierarchy: hierarchy.pending(),
            })
            .map_err(LoadError::Checkpoint)?;

        let as_of = config.as_of.unwrap_or_else(|| Utc::now().date_naive());
        let mut normalize = NormalizeOptions::new(as_of);
        normalize.min_affiliation_months = config.min_affiliation_months;

        let progress = if config.show_progress {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} [{elapsed_precise}] {pos} records {msg}")
                    .unwrap(),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb.set_position(offset);
            pb
        } else {
            ProgressBar::hidden()
        };

        Ok(Self {
            writer: BatchWriter::new(config.retry.clone()),
            config,
            store,
            source,
            checkpoints,
            dedup,
            hierarchy,
            stats,
            normalize,
            cancel: Arc::new(AtomicBool::new(false)),
            offset,
            resumed_from,
            batches_this_run: 0,
            exhausted: false,
            started: Instant::now(),
            progress,
        })
    }

    /// Flag checked between batches; setting it stops the run cleanly.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// Process batches until the source runs out, the batch limit is hit or the
    /// run is cancelled.
    pub async fn run(&mut self) -> Result<StopReason, LoadError> {
        loop {
            if self.exhausted {
                return Ok(StopReason::Exhausted);
            }
            if self.cancel.load(Ordering::SeqCst) {
                info!(offset = self.offset, "Cancellation requested, stopping");
                return Ok(StopReason::Cancelled);
            }
            if let Some(max) = self.config.max_batches {
                if self.batches_this_run >= u64::from(max) {
                    info!(batches = self.batches_this_run, "Reached batch limit for this run");
                    return Ok(StopReason::MaxBatches);
                }
            }

            let first = self.source.offset();
            let mut issues = BatchIssues::default();
            let records = self.read_batch(&mut issues)?;
            let end = self.source.offset();
            if end == first {
                self.exhausted = true;
                return Ok(StopReason::Exhausted);
            }

            self.process_batch(first, end, records, issues).await?;
        }
    }

    fn read_batch(
        &mut self,
        issues: &mut BatchIssues,
    ) -> Result<Vec<(u64, NormalizedRecord)>, LoadError> {
        let mut records = Vec::with_capacity(self.config.batch_size);
        while records.len() < self.config.batch_size {
            let item = match self.source.next() {
                Some(item) => item,
                None => {
                    self.exhausted = true;
                    break;
                }
            };
            match item {
                Ok(record) => match normalize(&record.value, &self.normalize) {
                    Ok(normalized) => records.push((record.offset, normalized)),
                    Err(e) => {
                        warn!(offset = record.offset, error = %e, "Skipping invalid record");
                        issues.invalid += 1;
                        let mut entry =
                            RecentError::new(FailureKind::Validation, record.offset, e.to_string());
                        if let Some(id) = raw_record_id(&record.value) {
                            entry = entry.with_record(id);
                        }
                        issues.errors.push(entry);
                    }
                },
                Err(SourceError::Corrupt { offset, message }) => match self.config.on_corrupt {
                    CorruptPolicy::Skip => {
                        warn!(offset, error = %message, "Skipping corrupt record");
                        issues.corrupt += 1;
                        issues
                            .errors
                            .push(RecentError::new(FailureKind::SourceCorrupt, offset, message));
                    }
                    CorruptPolicy::Abort => return Err(LoadError::CorruptAbort { offset, message }),
                },
                Err(SourceError::Io(e)) => return Err(LoadError::Source(e)),
            }

            let read = self.source.offset();
            if read % PROGRESS_INTERVAL == 0 {
                self.progress.set_position(read);
            }
        }
        Ok(records)
    }

    async fn process_batch(
        &mut self,
        first: u64,
        end: u64,
        records: Vec<(u64, NormalizedRecord)>,
        issues: BatchIssues,
    ) -> Result<(), LoadError> {
        let batch_number = self.stats.batches() + self.stats.failed().batches + 1;
        let outcome = self
            .writer
            .write(self.store.as_ref(), &mut self.dedup, &mut self.hierarchy, &records)
            .await;

        match outcome {
            Ok(batch) => self.apply_batch(batch_number, first, end, records.len(), batch),
            Err(failure) if failure.is_fatal() => {
                error!(
                    batch = batch_number,
                    offset = first,
                    error = %failure.error,
                    "Graph store unreachable, aborting run"
                );
                return Err(LoadError::ConnectionFatal {
                    attempts: failure.attempts,
                    source: failure.error,
                });
            }
            Err(failure) => {
                error!(
                    batch = batch_number,
                    first_offset = first,
                    last_offset = end - 1,
                    records = records.len(),
                    error = %failure,
                    "Batch failed, continuing with the next one"
                );
                self.stats.add_failed_batch(records.len() as u64);
                self.checkpoints.record_error(
                    RecentError::new(FailureKind::Write, first, failure.to_string()).through(end - 1),
                );
            }
        }

        self.stats.add_invalid(issues.invalid);
        self.stats.add_corrupt(issues.corrupt);
        for entry in issues.errors {
            self.checkpoints.record_error(entry);
        }

        self.offset = end;
        self.batches_this_run += 1;
        self.progress.set_position(end);

        let saved = self
            .checkpoints
            .maybe_save(|| Progress {
                offset: self.offset,
                batches_completed: self.stats.batches(),
                counters: self.stats.to_checkpoint(),
                pending_hierarchy: self.hierarchy.pending(),
            })
            .map_err(LoadError::Checkpoint)?;
        if saved {
            info!(offset = self.offset, batch = batch_number, "Checkpoint saved");
        }
        Ok(())
    }

    fn apply_batch(
        &mut self,
        batch_number: u64,
        first: u64,
        end: u64,
        records: usize,
        batch: PreparedBatch,
    ) {
        self.stats.add_batch(&batch.created, &batch.merged);
        self.stats.add_authors_skipped(batch.skipped_authors);

        for (offset, conflict) in &batch.conflicts {
            warn!(
                offset,
                candidate = %conflict.candidate_id,
                existing = %conflict.existing_id,
                tier = conflict.tier,
                reason = %conflict.reason,
                "Possible duplicate person not merged"
            );
            self.checkpoints.record_error(
                RecentError::new(FailureKind::DuplicateConflict, *offset, conflict.to_string())
                    .with_record(conflict.candidate_id.clone()),
            );
        }
        self.stats.add_merge_candidates(batch.conflicts.len() as u64);

        for (offset, edge) in &batch.cycles {
            warn!(
                offset,
                child = %edge.child_id,
                parent = %edge.parent_id,
                "PART_OF edge would create a cycle, not written"
            );
            self.checkpoints.record_error(
                RecentError::new(
                    FailureKind::HierarchyCycle,
                    *offset,
                    format!("{} PART_OF {} closes a cycle", edge.child_id, edge.parent_id),
                )
                .with_record(edge.child_id.clone()),
            );
        }
        self.stats.add_hierarchy_cycles(batch.cycles.len() as u64);

        if !batch.excluded.is_empty() {
            info!(
                batch = batch_number,
                excluded = batch.excluded.len(),
                "Affiliations excluded by policy"
            );
        }
        self.stats.add_affiliations_excluded(batch.excluded.len() as u64);

        debug!(
            batch = batch_number,
            first_offset = first,
            last_offset = end - 1,
            records,
            created = batch.created.total(),
            merged = batch.merged.total(),
            deferred_edges = batch.deferred_edges,
            "Batch done"
        );
        self.progress.set_message(format!(
            "{} publications, {} persons",
            self.stats.created().publications,
            self.stats.created().persons
        ));
    }

    /// Persist the final checkpoint and release the store.
    ///
    /// The checkpoint is marked completed only when the whole source was read.
    pub async fn close(mut self, stop: Option<StopReason>) -> Result<RunSummary, LoadError> {
        let status = if stop == Some(StopReason::Exhausted) {
            RunStatus::Completed
        } else {
            RunStatus::Interrupted
        };
        let unresolved = self.hierarchy.pending();
        if status == RunStatus::Completed && !unresolved.is_empty() {
            warn!(
                edges = unresolved.len(),
                "PART_OF edges left unresolved, parent organizations never appeared"
            );
        }

        let progress = Progress {
            offset: self.offset,
            batches_completed: self.stats.batches(),
            counters: self.stats.to_checkpoint(),
            pending_hierarchy: unresolved.clone(),
        };
        let saved = self.checkpoints.save(status, progress);
        self.progress.finish_and_clear();

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close graph store connection");
        }
        saved.map_err(LoadError::Checkpoint)?;

        info!(
            status = ?status,
            offset = self.offset,
            batches = self.batches_this_run,
            elapsed_secs = self.started.elapsed().as_secs(),
            "Load finished"
        );

        Ok(RunSummary {
            stop,
            status,
            offset: self.offset,
            resumed_from: self.resumed_from,
            batches_this_run: self.batches_this_run,
            batches_completed: self.stats.batches(),
            counters: self.stats.to_checkpoint(),
            recent_errors: self.checkpoints.recent_errors().to_vec(),
            unresolved_hierarchy: unresolved,
            elapsed: self.started.elapsed(),
        })
    }
}

/// Load `source_path` into `store`, resuming from whatever `checkpoint_store`
/// holds. The store connection is released on every exit path.
pub async fn run_load(
    source_path: &Path,
    config: LoaderConfig,
    store: Arc<dyn GraphStore>,
    checkpoint_store: Box<dyn CheckpointStore>,
    cancel: Arc<AtomicBool>,
) -> Result<RunSummary, LoadError> {
    let opened = Loader::open(source_path, config, Arc::clone(&store), checkpoint_store).await;
    let loader = match opened {
        Ok(loader) => loader,
        Err(e) => {
            if let Err(close_err) = store.close().await {
                warn!(error = %close_err, "Failed to close graph store connection");
            }
            return Err(e);
        }
    };
    let mut loader = loader.with_cancel(cancel);

    let outcome = loader.run().await;
    let summary = loader.close(outcome.as_ref().ok().copied()).await;
    match (outcome, summary) {
        (Ok(_), summary) => summary,
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "Final checkpoint could not be saved");
            Err(e)
        }
    }
}

fn fatal_source(e: SourceError) -> LoadError {
    match e {
        SourceError::Io(e) => LoadError::Source(e),
        SourceError::Corrupt { offset, message } => LoadError::CorruptAbort { offset, message },
    }
}

fn raw_record_id(value: &serde_json::Value) -> Option<String> {
    let id = value
        .get("_id")
        .or_else(|| value.get("_source").and_then(|s| s.get("Id")))
        .or_else(|| value.get("Id"))?;
    match id {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
