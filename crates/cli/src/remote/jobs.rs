//! Job store over HTTP.
//!
//! - `POST {base}/jobs` creates a job record (`ChunkJob` body)
//! - `GET {base}/jobs/{jobId}` reads it
//! - `POST {base}/jobs/{jobId}/progress` with `{completedDelta, failedDelta}`
//!   must be a single atomic increment on the server. Sent once, never
//!   retried: a lost response after the server applied it would double count.
//! - `PUT {base}/jobs/{jobId}/status` with `{status}`

use reqwest::Method;
use serde::Serialize;
use tillmatch_recon::model::{ChunkJob, JobStatus};
use tillmatch_recon::tracker::TrackerError;
use tillmatch_recon::JobStore;

use super::common::{HttpError, RemoteClient};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressBody {
    completed_delta: u64,
    failed_delta: u64,
}

#[derive(Serialize)]
struct StatusBody {
    status: JobStatus,
}

pub struct HttpJobStore {
    client: RemoteClient,
}

impl HttpJobStore {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    /// Register a job before its chunks start reporting.
    pub fn create_job(&self, job_id: &str, total_chunks: u64) -> Result<(), TrackerError> {
        let job = ChunkJob {
            job_id: job_id.to_string(),
            total_chunks,
            completed_chunks: 0,
            failed_chunks: 0,
            status: JobStatus::InProgress,
        };
        let url = self.client.endpoint(&["jobs"]);
        self.client
            .send_json(Method::POST, &url, &job)
            .map_err(tracker_error)?;
        Ok(())
    }
}

impl JobStore for HttpJobStore {
    fn get_job(&self, job_id: &str) -> Result<ChunkJob, TrackerError> {
        let url = self.client.endpoint(&["jobs", job_id]);
        self.client
            .get_json(&url, &[])
            .map_err(tracker_error)?
            .ok_or(TrackerError::NotFound)
    }

    fn atomic_add(
        &self,
        job_id: &str,
        completed_delta: u64,
        failed_delta: u64,
    ) -> Result<(), TrackerError> {
        let url = self.client.endpoint(&["jobs", job_id, "progress"]);
        let body = ProgressBody {
            completed_delta,
            failed_delta,
        };
        match self.client.send_json_once(Method::POST, &url, &body) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TrackerError::NotFound),
            Err(err) => Err(tracker_error(err)),
        }
    }

    fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), TrackerError> {
        let url = self.client.endpoint(&["jobs", job_id, "status"]);
        match self.client.send_json(Method::PUT, &url, &StatusBody { status }) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TrackerError::NotFound),
            Err(err) => Err(tracker_error(err)),
        }
    }
}

fn tracker_error(err: HttpError) -> TrackerError {
    TrackerError::Unavailable(err.to_string())
}
