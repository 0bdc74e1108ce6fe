//! Read-side projections of batch records for display.

use crate::error::BatchErrorEntry;
use crate::model::{BatchJob, BatchPurpose, BatchStatus};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Progress of one batch, or of one upload session grouping several.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgressInfo {
    /// Batch ids in this view, newest first.
    pub batch_ids: Vec<String>,
    pub status: BatchStatus,
    pub purpose: BatchPurpose,
    pub total_files: u32,
    pub processed_files: u32,
    pub successful_files: u32,
    pub failed_files: u32,
    pub blocked_files: u32,
    /// `processed / total * 100`, one decimal.
    pub progress_percent: f64,
    pub errors: Vec<BatchErrorEntry>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchProgressInfo {
    pub fn from_job(job: &BatchJob) -> Self {
        let mut info = Self {
            batch_ids: vec![job.id.clone()],
            status: job.status,
            purpose: job.purpose,
            total_files: job.total_files,
            processed_files: job.processed_files,
            successful_files: job.successful_files,
            failed_files: job.failed_files,
            blocked_files: job.blocked_files,
            progress_percent: 0.0,
            errors: job.errors.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        };
        info.refresh_percent();
        info
    }

    fn absorb(&mut self, job: &BatchJob) {
        self.batch_ids.push(job.id.clone());
        self.total_files += job.total_files;
        self.processed_files += job.processed_files;
        self.successful_files += job.successful_files;
        self.failed_files += job.failed_files;
        self.blocked_files += job.blocked_files;
        self.errors.extend(job.errors.iter().cloned());
        self.created_at = self.created_at.min(job.created_at);
        self.completed_at = match (self.completed_at, job.completed_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        self.status = merge_status(self.status, job.status);
        self.refresh_percent();
    }

    fn refresh_percent(&mut self) {
        self.progress_percent = if self.total_files == 0 {
            0.0
        } else {
            (f64::from(self.processed_files) * 1000.0 / f64::from(self.total_files)).round() / 10.0
        };
    }
}

/// A session is still running while any part is; it counts as completed
/// when any part completed.
fn merge_status(a: BatchStatus, b: BatchStatus) -> BatchStatus {
    if !a.is_terminal() || !b.is_terminal() {
        BatchStatus::Processing
    } else if a == BatchStatus::Completed || b == BatchStatus::Completed {
        BatchStatus::Completed
    } else {
        a
    }
}

/// One entry per non-terminal batch, newest first.
pub fn active_view(jobs: &[BatchJob]) -> Vec<BatchProgressInfo> {
    let mut active: Vec<&BatchJob> = jobs.iter().filter(|j| !j.status.is_terminal()).collect();
    active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    active.into_iter().map(BatchProgressInfo::from_job).collect()
}

/// Terminal batches grouped into sessions, newest first.
///
/// A batch joins the current session when it was created within `window`
/// of the session's newest batch and shares its purpose.
pub fn history_view(jobs: &[BatchJob], window: Duration) -> Vec<BatchProgressInfo> {
    let mut done: Vec<&BatchJob> = jobs.iter().filter(|j| j.status.is_terminal()).collect();
    done.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut groups: Vec<(DateTime<Utc>, BatchProgressInfo)> = Vec::new();
    for job in done {
        match groups.last_mut() {
            Some((newest, info))
                if info.purpose == job.purpose && *newest - job.created_at <= window =>
            {
                info.absorb(job);
            }
            _ => groups.push((job.created_at, BatchProgressInfo::from_job(job))),
        }
    }
    groups.into_iter().map(|(_, info)| info).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, status: BatchStatus, minutes_ago: i64, processed: u32) -> BatchJob {
        let mut j = BatchJob::new(id, "u1", None, BatchPurpose::Extraction, 4);
        j.status = status;
        j.processed_files = processed;
        j.successful_files = processed;
        j.created_at = Utc::now() - Duration::minutes(minutes_ago);
        j
    }

    #[test]
    fn history_groups_close_batches() {
        let jobs = vec![
            job("a", BatchStatus::Completed, 0, 4),
            job("b", BatchStatus::Failed, 2, 0),
            job("c", BatchStatus::Completed, 30, 4),
            job("d", BatchStatus::Processing, 1, 1),
        ];
        let history = history_view(&jobs, Duration::minutes(5));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].batch_ids, vec!["a", "b"]);
        assert_eq!(history[0].total_files, 8);
        assert_eq!(history[0].status, BatchStatus::Completed);
        assert_eq!(history[0].progress_percent, 50.0);
        assert_eq!(history[1].batch_ids, vec!["c"]);
    }

    #[test]
    fn active_lists_running_batches() {
        let jobs = vec![
            job("a", BatchStatus::Completed, 0, 4),
            job("p", BatchStatus::Pending, 3, 0),
            job("q", BatchStatus::Processing, 1, 1),
        ];
        let active = active_view(&jobs);
        assert_eq!(
            active.iter().map(|i| i.batch_ids[0].as_str()).collect::<Vec<_>>(),
            vec!["q", "p"]
        );
        assert_eq!(active[0].progress_percent, 25.0);
    }

    #[test]
    fn status_merge() {
        assert_eq!(
            merge_status(BatchStatus::Failed, BatchStatus::Completed),
            BatchStatus::Completed
        );
        assert_eq!(
            merge_status(BatchStatus::Failed, BatchStatus::Cancelled),
            BatchStatus::Failed
        );
    }
}
