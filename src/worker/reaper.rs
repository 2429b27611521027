//! Reaper: periodic removal of finished jobs and their files.
//!
//! Only terminal jobs are ever reaped. A job stuck in `Processing` stays in the
//! registry however old it is.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::worker::registry::JobRegistry;

/// Deletes terminal jobs once their retention window has elapsed.
pub struct Reaper {
    jobs: Arc<JobRegistry>,
    retention: chrono::Duration,
}

impl Reaper {
    pub fn new(jobs: Arc<JobRegistry>, retention: Duration) -> Self {
        Self {
            jobs,
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Remove every expired job as of `now`. Returns the number of records removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = self.jobs.expired(now, self.retention).await;
        let mut removed = 0;

        for job_id in expired {
            let Some(job) = self.jobs.remove(job_id).await else {
                continue;
            };
            removed += 1;

            match tokio::fs::remove_dir_all(&job.output_dir).await {
                Ok(()) => debug!(job_id = %job_id, "Removed job directory"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(
                    job_id = %job_id,
                    path = %job.output_dir.display(),
                    error = %e,
                    "Failed to remove job directory"
                ),
            }
        }

        if removed > 0 {
            info!(count = removed, "Reaped finished jobs");
        }
        removed
    }
}

/// Spawn a background task that sweeps every `interval` until cancelled.
pub fn spawn_reaper(
    reaper: Reaper,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Reaper started");
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    reaper.sweep(Utc::now()).await;
                }
            }
        }

        info!("Reaper stopped");
    })
}
