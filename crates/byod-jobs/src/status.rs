//! Status polling
//!
//! Polling is a plain loop with an elapsed-time bound. Running out of time is
//! an outcome, not an error: the job may still finish remotely.

use std::time::Duration;

use byod_core::types::JobStatusInfo;
use byod_core::{ByodError, ByodResult, JobStatus};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::platform::JobPlatform;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reports a status only the first time it is seen or when it changes.
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: Option<JobStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `status` differs from the previous observation.
    pub fn observe(&mut self, status: &JobStatus) -> bool {
        if self.last.as_ref() == Some(status) {
            return false;
        }
        self.last = Some(status.clone());
        true
    }

    pub fn last(&self) -> Option<&JobStatus> {
        self.last.as_ref()
    }
}

#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Completed(JobStatusInfo),
    Failed { status: JobStatus, error: String },
    TimedOut { last: Option<JobStatusInfo> },
}

/// Poll `job_id` until it reaches a terminal status or `timeout` elapses.
///
/// `on_change` sees every status change together with the elapsed time.
pub async fn wait_for_job<P, F>(
    platform: &P,
    job_id: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut on_change: F,
) -> ByodResult<WaitOutcome>
where
    P: JobPlatform + ?Sized,
    F: FnMut(&JobStatusInfo, Duration),
{
    let started = Instant::now();
    let mut tracker = StatusTracker::new();
    let mut last = None;

    loop {
        let info = platform.job_status(job_id).await?;
        let elapsed = started.elapsed();

        if tracker.observe(&info.status) {
            debug!(job_id, status = %info.status, elapsed_secs = elapsed.as_secs(), "job status changed");
            on_change(&info, elapsed);
        }

        match &info.status {
            JobStatus::Completed => {
                info!(job_id, "job completed");
                return Ok(WaitOutcome::Completed(info));
            }
            JobStatus::NotFound => {
                return Err(ByodError::NotFound(format!("job {job_id}")));
            }
            status if status.is_failure() => {
                return Ok(WaitOutcome::Failed {
                    status: status.clone(),
                    error: info.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
                });
            }
            _ => {}
        }

        last = Some(info);
        if started.elapsed() + poll_interval > timeout {
            info!(job_id, timeout_secs = timeout.as_secs(), "gave up waiting for job");
            return Ok(WaitOutcome::TimedOut { last });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_reports_changes_only() {
        let mut tracker = StatusTracker::new();
        assert!(tracker.observe(&JobStatus::Submitted));
        assert!(!tracker.observe(&JobStatus::Submitted));
        assert!(tracker.observe(&JobStatus::Processing));
        assert!(!tracker.observe(&JobStatus::Processing));
        assert!(tracker.observe(&JobStatus::Completed));
        assert_eq!(tracker.last(), Some(&JobStatus::Completed));
    }

    #[test]
    fn test_unknown_statuses_compare_by_value() {
        let mut tracker = StatusTracker::new();
        assert!(tracker.observe(&JobStatus::parse("warming")));
        assert!(!tracker.observe(&JobStatus::parse("WARMING")));
        assert!(tracker.observe(&JobStatus::parse("cooling")));
    }
}
