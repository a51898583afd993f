//! Durable job and schedule stores
//!
//! Trait-based repository abstractions decouple the dispatcher and
//! telemetry from the storage backend:
//! - [`JobStore`] / [`ScheduleStore`] — the interfaces
//! - [`sqlite`] — SQLite-backed implementation
//! - [`memory`] — in-memory implementation for tests
//!
//! The single correctness-critical operation is [`JobStore::claim`]: a
//! conditional `scheduled -> processing` transition guarded by the job's
//! current status, guaranteeing at most one concurrent processor per job
//! even with multiple dispatcher workers.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::{Job, JobStatus, Schedule, ScheduleStatus};

pub use memory::{MemoryJobStore, MemoryScheduleStore};
pub use sqlite::{open_database, SqliteJobStore, SqliteScheduleStore};

/// Errors from the storage layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Record not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A write would violate the job status transition table
    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// Corrupt or unparsable stored data
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt(reason.into())
    }

    /// Database errors are often transient (locks); data errors are not
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Job totals broken down by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub scheduled: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Cursor-based queue listing request
#[derive(Debug, Clone, Default)]
pub struct QueueQuery {
    /// Filter by job status
    pub status: Option<JobStatus>,
    /// Substring match on the recipient address
    pub search: Option<String>,
    /// Keyset cursor: the last job id of the previous page
    pub cursor: Option<String>,
    /// Page size
    pub limit: usize,
}

/// One page of the job queue
#[derive(Debug, Clone, Serialize)]
pub struct QueuePage {
    pub jobs: Vec<Job>,
    /// Pass back as `cursor` to fetch the next page; `None` when exhausted
    pub next_cursor: Option<String>,
}

/// Per-day job counts for the calendar view, keyed by schedule-agnostic UTC date
pub type DailyCounts = Vec<(NaiveDate, u64)>;

/// Durable records of individual send jobs and their state.
///
/// Implementations must enforce the status transition table: any write that
/// would violate it fails with [`StoreError::IllegalTransition`].
pub trait JobStore: Send + Sync {
    /// Bulk-insert jobs, skipping (schedule, recipient) pairs that already
    /// exist. Returns the number actually inserted.
    fn insert_jobs(&self, jobs: &[Job]) -> StoreResult<u64>;

    fn get(&self, job_id: &str) -> StoreResult<Option<Job>>;

    /// Atomically claim a job: `scheduled -> processing`, guarded by the
    /// current status. Returns `false` when another worker got there first.
    fn claim(&self, job_id: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Revert a claim after a rate-limit denial: `processing -> scheduled`
    /// with `send_at` and `attempts` unchanged (no penalty).
    fn release_claim(&self, job_id: &str) -> StoreResult<()>;

    /// Terminal success: `processing -> sent`
    fn mark_sent(
        &self,
        job_id: &str,
        sent_at: DateTime<Utc>,
        provider_message_id: &str,
    ) -> StoreResult<()>;

    /// Transient failure: `processing -> scheduled` with a new `send_at`
    /// and `attempts` incremented
    fn mark_retry(
        &self,
        job_id: &str,
        next_send_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()>;

    /// Terminal failure: `processing -> failed` with `attempts` incremented
    fn mark_failed(&self, job_id: &str, error: &str) -> StoreResult<()>;

    /// Re-stamp a scheduled job's `send_at` (window deferral; no penalty)
    fn defer(&self, job_id: &str, new_send_at: DateTime<Utc>) -> StoreResult<()>;

    /// Candidate selection: `scheduled` jobs with `send_at <= now`, ordered
    /// by `(send_at, id)` ascending for determinism.
    fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>>;

    /// Earliest `scheduled` jobs of one schedule by `(send_at, id)`,
    /// regardless of whether they are due. Used by the manual batch trigger.
    fn next_batch(&self, schedule_id: &str, limit: usize) -> StoreResult<Vec<Job>>;

    fn counts(&self, schedule_id: &str) -> StoreResult<StatusCounts>;

    /// Minimum `send_at` among `scheduled` jobs
    fn next_send_at(&self, schedule_id: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Maximum `sent_at` among `sent` jobs
    fn last_sent_at(&self, schedule_id: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Count of jobs that reached `sent` at or after `since`
    fn sent_since(&self, schedule_id: &str, since: DateTime<Utc>) -> StoreResult<u64>;

    /// Planned sends per UTC day (`scheduled` jobs by `send_at` date)
    fn planned_by_day(
        &self,
        schedule_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DailyCounts>;

    /// Actual sends per UTC day (`sent` jobs by `sent_at` date)
    fn sent_by_day(
        &self,
        schedule_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<DailyCounts>;

    /// Paginated queue listing
    fn list(&self, schedule_id: &str, query: &QueueQuery) -> StoreResult<QueuePage>;

    /// Jobs currently mid-processing; timing config is frozen while nonzero
    fn count_processing(&self, schedule_id: &str) -> StoreResult<u64>;
}

/// Durable per-campaign-step configuration
pub trait ScheduleStore: Send + Sync {
    fn create(&self, schedule: &Schedule) -> StoreResult<()>;

    fn get(&self, schedule_id: &str) -> StoreResult<Option<Schedule>>;

    /// Full config update. Callers validate and enforce the mid-processing
    /// freeze before writing.
    fn update(&self, schedule: &Schedule) -> StoreResult<()>;

    fn set_paused(&self, schedule_id: &str, paused: bool) -> StoreResult<()>;

    fn set_status(&self, schedule_id: &str, status: ScheduleStatus) -> StoreResult<()>;

    fn set_next_run_at(
        &self,
        schedule_id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    fn set_last_run_at(&self, schedule_id: &str, last_run_at: DateTime<Utc>) -> StoreResult<()>;

    /// Schedules the dispatcher should consider this tick: status allows
    /// dispatch and the pause flag is clear.
    fn list_dispatchable(&self) -> StoreResult<Vec<Schedule>>;

    fn list_all(&self) -> StoreResult<Vec<Schedule>>;
}

/// Shared transition guard used by both implementations
pub(crate) fn check_transition(
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
) -> StoreResult<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            job_id: job_id.to_string(),
            from,
            to,
        })
    }
}
