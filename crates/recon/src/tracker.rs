use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::info;

use crate::config::DateRange;
use crate::error::ReconError;
use crate::model::{ChunkJob, JobStatus};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("job not found")]
    NotFound,
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Persistent job record store.
///
/// `atomic_add` must be a single unconditional increment on the store side;
/// the completion check is a separate read followed by `set_status`.
pub trait JobStore: Send + Sync {
    fn get_job(&self, job_id: &str) -> Result<ChunkJob, TrackerError>;
    fn atomic_add(&self, job_id: &str, completed_delta: u64, failed_delta: u64)
        -> Result<(), TrackerError>;
    fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), TrackerError>;
}

pub struct JobTracker<'a> {
    store: &'a dyn JobStore,
}

impl<'a> JobTracker<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self { store }
    }

    /// Count finished chunks, then flip the job to `Completed` once every
    /// chunk is accounted for. Two workers may both observe completion and
    /// both write the status; the write is idempotent.
    pub fn record_progress(
        &self,
        job_id: &str,
        completed_delta: u64,
        failed_delta: u64,
    ) -> Result<ChunkJob, ReconError> {
        let err = |e: TrackerError| ReconError::Tracker {
            job_id: job_id.to_string(),
            message: e.to_string(),
        };

        self.store
            .atomic_add(job_id, completed_delta, failed_delta)
            .map_err(err)?;
        let mut job = self.store.get_job(job_id).map_err(err)?;

        if !job.status.is_terminal() && job.all_chunks_accounted() {
            self.store
                .set_status(job_id, JobStatus::Completed)
                .map_err(err)?;
            info!(
                job = job_id,
                completed = job.completed_chunks,
                failed = job.failed_chunks,
                "job completed"
            );
            job.status = JobStatus::Completed;
        }
        Ok(job)
    }

    /// Abort a job outright, e.g. when its chunks cannot be planned.
    pub fn fail_job(&self, job_id: &str) -> Result<(), ReconError> {
        self.store
            .set_status(job_id, JobStatus::Failed)
            .map_err(|e| ReconError::Tracker {
                job_id: job_id.to_string(),
                message: e.to_string(),
            })
    }
}

/// Split a job's range into day-aligned chunk ranges.
pub fn plan_chunks(range: &DateRange, days_per_chunk: u32) -> Vec<DateRange> {
    range.split_days(days_per_chunk)
}

struct JobCounters {
    total: u64,
    completed: AtomicU64,
    failed: AtomicU64,
    status: Mutex<JobStatus>,
    completions: AtomicU64,
}

/// In-process job store for local runs and tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Arc<JobCounters>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self, job_id: impl Into<String>, total_chunks: u64) {
        self.jobs.write().insert(
            job_id.into(),
            Arc::new(JobCounters {
                total: total_chunks,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                status: Mutex::new(JobStatus::InProgress),
                completions: AtomicU64::new(0),
            }),
        );
    }

    /// How many times the job actually transitioned into `Completed`.
    pub fn completion_transitions(&self, job_id: &str) -> u64 {
        self.jobs
            .read()
            .get(job_id)
            .map_or(0, |j| j.completions.load(Ordering::Acquire))
    }

    fn counters(&self, job_id: &str) -> Result<Arc<JobCounters>, TrackerError> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or(TrackerError::NotFound)
    }
}

impl JobStore for MemoryJobStore {
    fn get_job(&self, job_id: &str) -> Result<ChunkJob, TrackerError> {
        let c = self.counters(job_id)?;
        let status = *c.status.lock();
        Ok(ChunkJob {
            job_id: job_id.to_string(),
            total_chunks: c.total,
            completed_chunks: c.completed.load(Ordering::Acquire),
            failed_chunks: c.failed.load(Ordering::Acquire),
            status,
        })
    }

    fn atomic_add(
        &self,
        job_id: &str,
        completed_delta: u64,
        failed_delta: u64,
    ) -> Result<(), TrackerError> {
        let c = self.counters(job_id)?;
        c.completed.fetch_add(completed_delta, Ordering::AcqRel);
        c.failed.fetch_add(failed_delta, Ordering::AcqRel);
        Ok(())
    }

    fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), TrackerError> {
        let c = self.counters(job_id)?;
        let mut current = c.status.lock();
        if *current != status && status == JobStatus::Completed {
            c.completions.fetch_add(1, Ordering::AcqRel);
        }
        *current = status;
        Ok(())
    }
}
