//! Lease expiry for orphaned `IN_PROGRESS` jobs.
//!
//! A process that dies between claim and completion leaves its job claimed.
//! The sweeper returns such jobs to `PENDING` once their lease is older than
//! the timeout; the attempt count is not touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use super::types::JobId;
use super::worker::{WorkerHandle, spawn_periodic};
use crate::store::{JobStore, StoreError};

pub struct StaleJobSweeper {
    jobs: Arc<dyn JobStore>,
    lease_timeout: Duration,
    interval: Duration,
}

impl StaleJobSweeper {
    pub fn new(jobs: Arc<dyn JobStore>, lease_timeout: Duration, interval: Duration) -> Self {
        Self {
            jobs,
            lease_timeout,
            interval,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let lease = chrono::Duration::from_std(self.lease_timeout)
            .unwrap_or(chrono::Duration::days(1));
        let released = self.jobs.release_stale(now - lease, now).await?;
        for job_id in &released {
            warn!(job_id = %job_id, "released job with expired lease");
        }
        Ok(released)
    }

    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let interval = self.interval;
        spawn_periodic("stale-job-sweeper".to_string(), interval, move || {
            let sweeper = Arc::clone(&self);
            async move {
                if let Err(err) = sweeper.sweep(Utc::now()).await {
                    error!(error = %err, "stale job sweep failed");
                }
            }
        })
    }
}
