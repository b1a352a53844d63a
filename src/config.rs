use crate::source::SourceFormat;
use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Publications per write transaction
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Save a checkpoint every N batches
pub const DEFAULT_CHECKPOINT_EVERY: u32 = 5;

/// Bump when the checkpoint layout changes; older files are ignored
pub const CHECKPOINT_VERSION: u32 = 1;

/// Number of failures kept in the checkpoint's error tail
pub const RECENT_ERRORS_LIMIT: usize = 50;

/// End year used by the source to mark an affiliation that was never closed
pub const AFFILIATION_OPEN_END_YEAR: i32 = 9999;

/// Affiliations shorter than this many whole months are excluded
pub const DEFAULT_MIN_AFFILIATION_MONTHS: u32 = 6;

/// Write attempts per batch before it is reported as failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Progress update interval (tick every N records)
pub const PROGRESS_INTERVAL: u64 = 100;

pub const DEFAULT_BOLT_URI: &str = "bolt://localhost:7687";
pub const DEFAULT_BOLT_USER: &str = "neo4j";
pub const DEFAULT_CHECKPOINT_FILE: &str = "ingestion_progress.json";

pub const CONNECT_MAX_RETRIES: u32 = 5;
pub const CONNECT_RETRY_DELAY_SECS: u64 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,
    #[error("checkpoint_every must be greater than zero")]
    ZeroCheckpointInterval,
    #[error("max_batches must be greater than zero when set")]
    ZeroMaxBatches,
    #[error("retry policy needs at least one attempt")]
    ZeroAttempts,
}

/// What to do with a record the reader cannot parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptPolicy {
    #[default]
    Skip,
    Abort,
}

/// Bounded retry with exponential backoff. Always terminates after `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Limit on batches processed by this run (not cumulative across resumes)
    pub max_batches: Option<u32>,
    pub checkpoint_every: u32,
    pub retry: RetryPolicy,
    pub on_corrupt: CorruptPolicy,
    pub min_affiliation_months: u32,
    /// Match people by display name when no stronger identifier is available
    pub display_name_fallback: bool,
    pub recent_errors_limit: usize,
    pub show_progress: bool,
    /// Reference date for current vs. historical affiliations; today when unset
    pub as_of: Option<NaiveDate>,
    /// Source layout; detected from the file when unset
    pub format: Option<SourceFormat>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batches: None,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            retry: RetryPolicy::default(),
            on_corrupt: CorruptPolicy::Skip,
            min_affiliation_months: DEFAULT_MIN_AFFILIATION_MONTHS,
            display_name_fallback: true,
            recent_errors_limit: RECENT_ERRORS_LIMIT,
            show_progress: false,
            as_of: None,
            format: None,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.checkpoint_every == 0 {
            return Err(ConfigError::ZeroCheckpointInterval);
        }
        if self.max_batches == Some(0) {
            return Err(ConfigError::ZeroMaxBatches);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}
