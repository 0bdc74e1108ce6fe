//! Remote asynchronous extraction service.
//!
//! [`BatchService`] is the narrow seam the batch manager talks to. The
//! production implementation is [`GeminiBatchService`]; tests substitute an
//! in-process fake.
//!
//! Implementations perform exactly one HTTP exchange per call. Retrying is
//! the caller's business, through [`crate::retry::RetryPolicy`] and
//! [`ServiceError::class`].

pub mod gemini;

pub use gemini::GeminiBatchService;

use crate::error::ServiceError;
use crate::model::BatchStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

/// Remote job state, with the `BATCH_STATE_` / `JOB_STATE_` prefixes removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl RemoteState {
    pub fn parse(raw: &str) -> Option<Self> {
        let bare = raw
            .trim()
            .trim_start_matches("BATCH_STATE_")
            .trim_start_matches("JOB_STATE_");
        Some(match bare {
            "PENDING" | "QUEUED" | "UNSPECIFIED" => RemoteState::Pending,
            "RUNNING" | "PROCESSING" => RemoteState::Running,
            "SUCCEEDED" | "COMPLETED" => RemoteState::Succeeded,
            "FAILED" => RemoteState::Failed,
            "CANCELLED" | "CANCELLING" => RemoteState::Cancelled,
            "EXPIRED" => RemoteState::Expired,
            _ => return None,
        })
    }

    /// Local status this remote state maps to.
    pub fn local(&self) -> BatchStatus {
        match self {
            RemoteState::Pending => BatchStatus::Pending,
            RemoteState::Running => BatchStatus::Processing,
            RemoteState::Succeeded => BatchStatus::Completed,
            RemoteState::Failed => BatchStatus::Failed,
            RemoteState::Cancelled => BatchStatus::Cancelled,
            RemoteState::Expired => BatchStatus::Expired,
        }
    }
}

/// Where a job reads its requests from.
#[derive(Debug, Clone)]
pub enum JobInput {
    /// A previously uploaded JSONL file.
    File { file_name: String },
    /// Requests embedded in the create call (see
    /// [`crate::codec::batch_line::to_inline`]).
    Inline { requests: Vec<Value> },
}

/// Where a finished job put its results.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    /// A JSONL file to download.
    File { file_name: String },
    /// Output records returned in the job itself.
    Inline { responses: Vec<Value> },
}

/// Snapshot of a remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteJob {
    pub id: String,
    pub state: RemoteState,
    pub output: Option<JobOutput>,
    /// Job-level error message, if the service reported one.
    pub error: Option<String>,
}

#[async_trait]
pub trait BatchService: Send + Sync {
    /// Upload a JSONL request file. Returns the service-side file name.
    async fn upload_file(&self, display_name: &str, content: Vec<u8>)
        -> Result<String, ServiceError>;

    async fn create_job(&self, display_name: &str, input: JobInput)
        -> Result<RemoteJob, ServiceError>;

    async fn get_job(&self, id: &str) -> Result<RemoteJob, ServiceError>;

    async fn cancel_job(&self, id: &str) -> Result<(), ServiceError>;

    /// Download an output file to `dest`. Returns the number of bytes written.
    async fn download_file(&self, file_name: &str, dest: &Path) -> Result<u64, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_states_map_to_local() {
        assert_eq!(
            RemoteState::parse("BATCH_STATE_RUNNING").map(|s| s.local()),
            Some(BatchStatus::Processing)
        );
        assert_eq!(
            RemoteState::parse("JOB_STATE_SUCCEEDED").map(|s| s.local()),
            Some(BatchStatus::Completed)
        );
        assert_eq!(
            RemoteState::parse("BATCH_STATE_EXPIRED"),
            Some(RemoteState::Expired)
        );
        assert_eq!(RemoteState::parse("BATCH_STATE_BOGUS"), None);
    }
}
