//! Job context: what a handler sees of the job it runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::media::process::{Progress, ProgressSink};
use crate::worker::job::{Job, JobKind, JobRequest};
use crate::worker::registry::JobRegistry;

/// Handle passed to a handler for the duration of one job.
///
/// Progress and message writes go straight to the registry so pollers see them
/// while the handler is still running.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub params: JobRequest,
    pub output_dir: PathBuf,
    registry: Arc<JobRegistry>,
}

impl JobContext {
    pub(crate) fn new(job: &Job, registry: Arc<JobRegistry>) -> Self {
        Self {
            job_id: job.id,
            kind: job.job_type,
            params: job.params.clone(),
            output_dir: job.output_dir.clone(),
            registry,
        }
    }

    /// Directory where the handler stages and stores its artifacts.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Update progress (clamped to [0, 100]) and message.
    pub async fn report(&self, progress: f32, message: impl Into<String>) {
        let message = message.into();
        let progress = progress.clamp(0.0, 100.0);
        if let Err(e) = self
            .registry
            .update(self.job_id, |job| {
                job.progress = progress;
                job.message = message;
            })
            .await
        {
            tracing::debug!(job_id = %self.job_id, error = %e, "Dropped progress update");
        }
    }

    /// Update the message only.
    pub async fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        let _ = self
            .registry
            .update(self.job_id, |job| job.message = message)
            .await;
    }
}

#[async_trait]
impl ProgressSink for JobContext {
    async fn update(&self, progress: Progress) {
        match progress.percent {
            Some(percent) => self.report(percent, progress.message).await,
            None => self.set_message(progress.message).await,
        }
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("kind", &self.kind)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}
