//! Job scheduler: admission into the FIFO queue and status queries.
//!
//! The Scheduler owns the job registry, the handler registry and the sending
//! half of the admission queue. Workers are started once from it and consume
//! the receiving half.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::handlers::HandlerRegistry;
use crate::worker::job::{Job, JobRequest};
use crate::worker::pool::WorkerPool;
use crate::worker::registry::{JobRegistry, RegistrySummary};
use crate::worker::state::JobStatus;

/// Admits jobs and answers status queries.
pub struct Scheduler {
    jobs: Arc<JobRegistry>,
    handlers: Arc<HandlerRegistry>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    /// Taken by the worker pool when it starts.
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(jobs: Arc<JobRegistry>, handlers: Arc<HandlerRegistry>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            jobs,
            handlers,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    /// Create a job and place it on the admission queue.
    pub async fn create_job(&self, params: JobRequest) -> Result<Job, JobError> {
        let job = self.stage(params).await?;
        self.enqueue(job.id)?;
        Ok(job)
    }

    /// Create a `Queued` job without enqueueing it yet.
    ///
    /// Used when input has to be written into the job's output directory
    /// before any worker may claim it. Follow with [`Scheduler::enqueue`] or
    /// [`Scheduler::discard`].
    pub async fn stage(&self, params: JobRequest) -> Result<Job, JobError> {
        self.jobs.create(params).await
    }

    /// Put a staged job on the admission queue.
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), JobError> {
        self.queue_tx
            .send(job_id)
            .map_err(|_| JobError::QueueClosed)?;
        tracing::info!(job_id = %job_id, "Job queued");
        Ok(())
    }

    /// Drop a staged job together with its output directory.
    pub async fn discard(&self, job_id: Uuid) {
        if let Some(job) = self.jobs.remove(job_id).await
            && let Err(e) = tokio::fs::remove_dir_all(&job.output_dir).await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove discarded job directory");
        }
    }

    /// Mutate the parameters of a job that no worker has claimed yet.
    pub async fn amend_request<F>(&self, job_id: Uuid, f: F) -> Result<(), JobError>
    where
        F: FnOnce(&mut JobRequest),
    {
        self.jobs
            .update(job_id, |job| {
                if job.status != JobStatus::Queued {
                    return Err(JobError::InvalidTransition {
                        id: job_id,
                        state: job.status.to_string(),
                        target: "amended request".to_string(),
                    });
                }

                let mut params = job.params.clone();
                f(&mut params);
                if params.kind() != job.job_type {
                    return Err(JobError::KindMismatch {
                        id: job_id,
                        expected: job.job_type.to_string(),
                        found: params.kind().to_string(),
                    });
                }
                job.params = params;
                Ok(())
            })
            .await?
    }

    /// Get a job snapshot.
    pub async fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.get(job_id).await
    }

    /// 1-based position among queued jobs, 0 when not queued.
    pub async fn queue_position(&self, job_id: Uuid) -> usize {
        self.jobs.queue_position(job_id).await
    }

    /// Counts per status.
    pub async fn summary(&self) -> RegistrySummary {
        self.jobs.summary().await
    }

    /// Start `count` workers consuming the admission queue.
    pub fn start_workers(
        &self,
        count: usize,
        cancel: CancellationToken,
    ) -> Result<WorkerPool, JobError> {
        let receiver = match self.queue_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(JobError::AlreadyStarted)?;

        Ok(WorkerPool::spawn(
            count,
            receiver,
            Arc::clone(&self.jobs),
            Arc::clone(&self.handlers),
            cancel,
        ))
    }

    /// Get access to the job registry.
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Get access to the handler registry.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }
}
