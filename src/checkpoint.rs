use crate::config::CHECKPOINT_VERSION;
use crate::error::FailureKind;
use crate::models::HierarchyEdge;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityCounters {
    pub publications: u64,
    pub persons: u64,
    pub organizations: u64,
    pub relationships: u64,
}

impl EntityCounters {
    pub fn total(&self) -> u64 {
        self.publications + self.persons + self.organizations + self.relationships
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SkippedCounters {
    pub invalid_records: u64,
    pub corrupt_records: u64,
    pub authors: u64,
    pub affiliations: u64,
    pub hierarchy_cycles: u64,
    pub merge_candidates: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FailedCounters {
    pub records: u64,
    pub batches: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct CheckpointCounters {
    pub created: EntityCounters,
    pub merged: EntityCounters,
    pub skipped: SkippedCounters,
    pub failed: FailedCounters,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecentError {
    pub kind: FailureKind,
    pub offset: u64,
    /// Last offset of a failed batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_end: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl RecentError {
    pub fn new(kind: FailureKind, offset: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            offset,
            offset_end: None,
            record_id: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn through(mut self, offset_end: u64) -> Self {
        self.offset_end = Some(offset_end);
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u32,
    pub status: RunStatus,
    pub input_path: String,
    pub input_mtime: u64,
    /// Next record offset to read
    pub offset: u64,
    #[serde(default)]
    pub batches_completed: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub counters: CheckpointCounters,
    #[serde(default)]
    pub recent_errors: Vec<RecentError>,
    #[serde(default)]
    pub pending_hierarchy: Vec<HierarchyEdge>,
}

/// Identifies the export a checkpoint belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFingerprint {
    pub path: String,
    pub mtime: u64,
}

impl InputFingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;
        let mtime = metadata
            .modified()
            .context("Failed to get modification time")?
            .duration_since(SystemTime::UNIX_EPOCH)
            .context("Invalid modification time")?
            .as_secs();
        Ok(Self {
            path: path.to_string_lossy().to_string(),
            mtime,
        })
    }
}

/// Where checkpoint bytes live.
pub trait CheckpointStore: Send {
    fn load(&self) -> Result<Option<Vec<u8>>>;
    /// Must replace the previous checkpoint atomically
    fn save(&self, bytes: &[u8]) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn describe(&self) -> String;
}

pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("Failed to read checkpoint file: {:?}", self.path))?;
        Ok(Some(bytes))
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, bytes)
            .with_context(|| format!("Failed to write temp checkpoint file: {:?}", tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to rename temp checkpoint: {:?}", self.path))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove checkpoint file: {:?}", self.path))?;
            info!("Checkpoint cleared");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Shared in-memory checkpoint storage. Clones see the same slot, so a test can
/// keep one handle while the loader owns another.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
    fail_saves: Arc<AtomicBool>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Parsed contents, if any
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        let bytes = self.load().ok().flatten()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn put(&self, bytes: Vec<u8>) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(bytes);
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match self.slot.lock() {
            Ok(slot) => Ok(slot.clone()),
            Err(_) => bail!("Checkpoint slot lock poisoned"),
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("Checkpoint storage refused the write");
        }
        self.put(bytes.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match self.slot.lock() {
            Ok(mut slot) => {
                *slot = None;
                Ok(())
            }
            Err(_) => bail!("Checkpoint slot lock poisoned"),
        }
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// Parse whatever is stored without validating it against an input.
pub fn inspect(store: &dyn CheckpointStore) -> Result<Option<Checkpoint>> {
    let Some(bytes) = store.load()? else {
        return Ok(None);
    };
    let checkpoint = serde_json::from_slice(&bytes)
        .with_context(|| format!("Checkpoint at {} is not valid JSON", store.describe()))?;
    Ok(Some(checkpoint))
}

/// The stored checkpoint if it belongs to this input and layout version.
/// Anything unusable is treated as "no checkpoint".
pub fn load_if_valid(store: &dyn CheckpointStore, input: &InputFingerprint) -> Option<Checkpoint> {
    let checkpoint = match inspect(store) {
        Ok(Some(c)) => c,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "Checkpoint is corrupt or unreadable, starting from the beginning");
            return None;
        }
    };

    if checkpoint.version != CHECKPOINT_VERSION {
        info!(
            cached = checkpoint.version,
            current = CHECKPOINT_VERSION,
            "Checkpoint version mismatch"
        );
        return None;
    }

    if checkpoint.input_path != input.path {
        info!(
            cached = checkpoint.input_path,
            current = input.path,
            "Checkpoint input path mismatch"
        );
        return None;
    }

    if checkpoint.input_mtime != input.mtime {
        info!(
            cached_mtime = checkpoint.input_mtime,
            current_mtime = input.mtime,
            "Input file has changed since checkpoint was created"
        );
        return None;
    }

    info!(
        offset = checkpoint.offset,
        batches = checkpoint.batches_completed,
        status = ?checkpoint.status,
        "Loaded valid checkpoint"
    );
    Some(checkpoint)
}

/// Failure tail kept in the checkpoint; oldest entries fall off first.
#[derive(Debug, Clone)]
pub struct RecentErrors {
    items: VecDeque<RecentError>,
    limit: usize,
}

impl RecentErrors {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(limit.min(64)),
            limit,
        }
    }

    pub fn from_vec(errors: Vec<RecentError>, limit: usize) -> Self {
        let mut tail = Self::new(limit);
        for error in errors {
            tail.push(error);
        }
        tail
    }

    pub fn push(&mut self, error: RecentError) {
        if self.limit == 0 {
            return;
        }
        while self.items.len() >= self.limit {
            self.items.pop_front();
        }
        self.items.push_back(error);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecentError> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<RecentError> {
        self.items.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    NotStarted,
    Running,
    CheckpointSaved,
    Completed,
    Interrupted,
}

/// Loader progress at a batch boundary.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub offset: u64,
    pub batches_completed: u64,
    pub counters: CheckpointCounters,
    pub pending_hierarchy: Vec<HierarchyEdge>,
}

pub struct CheckpointManager {
    store: Box<dyn CheckpointStore>,
    input: InputFingerprint,
    interval: u32,
    batches_since_save: u32,
    state: CheckpointState,
    recent_errors: RecentErrors,
}

impl CheckpointManager {
    pub fn new(
        store: Box<dyn CheckpointStore>,
        input: InputFingerprint,
        interval: u32,
        recent_errors_limit: usize,
    ) -> Self {
        Self {
            store,
            input,
            interval: interval.max(1),
            batches_since_save: 0,
            state: CheckpointState::NotStarted,
            recent_errors: RecentErrors::new(recent_errors_limit),
        }
    }

    /// Checkpoint to resume from. A completed pass is not resumed; the next run
    /// starts over from offset 0.
    pub fn restore(&mut self) -> Option<Checkpoint> {
        let checkpoint = load_if_valid(self.store.as_ref(), &self.input)?;
        if checkpoint.status == RunStatus::Completed {
            info!(
                batches = checkpoint.batches_completed,
                "Previous pass completed, starting a fresh pass"
            );
            return None;
        }
        self.recent_errors = RecentErrors::from_vec(
            checkpoint.recent_errors.clone(),
            self.recent_errors.limit,
        );
        Some(checkpoint)
    }

    /// Marks the run as started and persists it, so a crash before the first
    /// interval save still leaves a Running checkpoint for this input.
    pub fn start(&mut self, progress: Progress) -> Result<()> {
        self.save(RunStatus::Running, progress)?;
        self.state = CheckpointState::Running;
        Ok(())
    }

    pub fn state(&self) -> CheckpointState {
        self.state
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    pub fn record_error(&mut self, error: RecentError) {
        self.recent_errors.push(error);
    }

    pub fn recent_errors(&self) -> &RecentErrors {
        &self.recent_errors
    }

    /// Count a finished batch and save once `interval` batches have accumulated.
    /// `progress` is only evaluated when a save happens.
    pub fn maybe_save(&mut self, progress: impl FnOnce() -> Progress) -> Result<bool> {
        self.state = CheckpointState::Running;
        self.batches_since_save += 1;
        if self.batches_since_save < self.interval {
            return Ok(false);
        }
        self.save(RunStatus::Running, progress())?;
        Ok(true)
    }

    pub fn save(&mut self, status: RunStatus, progress: Progress) -> Result<()> {
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            status,
            input_path: self.input.path.clone(),
            input_mtime: self.input.mtime,
            offset: progress.offset,
            batches_completed: progress.batches_completed,
            updated_at: Utc::now(),
            counters: progress.counters,
            recent_errors: self.recent_errors.to_vec(),
            pending_hierarchy: progress.pending_hierarchy,
        };

        let bytes = serde_json::to_vec_pretty(&checkpoint).context("Failed to serialize checkpoint")?;
        self.store
            .save(&bytes)
            .with_context(|| format!("Failed to save checkpoint to {}", self.store.describe()))?;

        self.batches_since_save = 0;
        self.state = match status {
            RunStatus::Running => CheckpointState::CheckpointSaved,
            RunStatus::Completed => CheckpointState::Completed,
            RunStatus::Interrupted => CheckpointState::Interrupted,
        };

        debug!(
            offset = checkpoint.offset,
            batches = checkpoint.batches_completed,
            status = ?status,
            "Checkpoint saved"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }
}
