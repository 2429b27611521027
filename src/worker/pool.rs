//! Worker pool: a fixed number of loops draining the admission queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::JobContext;
use crate::error::HandlerError;
use crate::handlers::HandlerRegistry;
use crate::worker::registry::JobRegistry;
use crate::worker::state::JobStatus;

/// Shared dependencies of every worker loop.
#[derive(Clone)]
pub struct WorkerDeps {
    pub jobs: Arc<JobRegistry>,
    pub handlers: Arc<HandlerRegistry>,
}

/// Running worker loops.
pub struct WorkerPool {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        count: usize,
        receiver: mpsc::UnboundedReceiver<Uuid>,
        jobs: Arc<JobRegistry>,
        handlers: Arc<HandlerRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Arc::new(Mutex::new(receiver));
        let deps = WorkerDeps { jobs, handlers };

        let workers = (0..count.max(1))
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let deps = deps.clone();
                let cancel = cancel.clone();
                tokio::spawn(worker_loop(worker_id, queue, deps, cancel))
            })
            .collect();

        Self { cancel, workers }
    }

    /// Number of worker loops.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new jobs, give in-flight handlers `grace` to finish, then abandon them.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();

        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        let drained = tokio::time::timeout(grace, futures::future::join_all(self.workers)).await;

        if drained.is_err() {
            warn!("Workers still busy after shutdown grace, abandoning in-flight jobs");
            for handle in aborts {
                handle.abort();
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    deps: WorkerDeps,
    cancel: CancellationToken,
) {
    info!(worker = worker_id, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };

        let Some(job_id) = next else {
            debug!(worker = worker_id, "Admission queue closed");
            break;
        };

        run_job(worker_id, job_id, &deps).await;
    }

    info!(worker = worker_id, "Worker stopped");
}

/// Claim one job, run its handler and record the outcome.
pub(crate) async fn run_job(worker_id: usize, job_id: Uuid, deps: &WorkerDeps) {
    let claimed = deps
        .jobs
        .update(job_id, |job| {
            job.transition_to(JobStatus::Processing, "Processing...")
                .map(|()| job.clone())
        })
        .await;

    let job = match claimed {
        Ok(Ok(job)) => job,
        Ok(Err(reason)) => {
            warn!(worker = worker_id, job_id = %job_id, reason = %reason, "Skipping job that cannot be claimed");
            return;
        }
        Err(_) => {
            debug!(worker = worker_id, job_id = %job_id, "Dequeued unknown job, discarding");
            return;
        }
    };

    info!(worker = worker_id, job_id = %job_id, kind = %job.job_type, "Job claimed");

    let recorded = match deps.handlers.get(job.job_type).await {
        None => {
            warn!(job_id = %job_id, kind = %job.job_type, "No handler registered");
            let reason = format!("No handler for job type: {}", job.job_type);
            deps.jobs.update(job_id, |j| j.fail(&reason)).await
        }
        Some(handler) => {
            let ctx = JobContext::new(&job, Arc::clone(&deps.jobs));
            let outcome =
                AbortOnDropHandle::new(tokio::spawn(async move { handler.run(ctx).await })).await;

            match outcome {
                Ok(Ok(output)) => {
                    info!(worker = worker_id, job_id = %job_id, "Job complete");
                    deps.jobs.update(job_id, |j| j.complete(output)).await
                }
                Ok(Err(e)) => {
                    warn!(worker = worker_id, job_id = %job_id, error = %e, "Job failed");
                    let reason = e.to_string();
                    deps.jobs.update(job_id, |j| j.fail(&reason)).await
                }
                Err(join_error) => {
                    let e = handler_crash(join_error);
                    warn!(worker = worker_id, job_id = %job_id, error = %e, "Job handler crashed");
                    let reason = e.to_string();
                    deps.jobs.update(job_id, |j| j.fail(&reason)).await
                }
            }
        }
    };

    match recorded {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => warn!(job_id = %job_id, reason = %reason, "Could not record job outcome"),
        Err(e) => warn!(job_id = %job_id, error = %e, "Job vanished before its outcome was recorded"),
    }
}

fn handler_crash(join_error: JoinError) -> HandlerError {
    if join_error.is_cancelled() {
        return HandlerError::Failed("Handler was cancelled".to_string());
    }

    let payload = join_error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    HandlerError::Panicked(message)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::*;
    use crate::handlers::JobHandler;
    use crate::worker::job::{
        AudioSource, Job, JobKind, JobOutput, JobRequest, MAX_MESSAGE_LEN, OutputFormat,
        StemSelection,
    };
    use crate::worker::scheduler::Scheduler;

    const WAIT: Duration = Duration::from_secs(5);

    /// Records the order in which jobs reach the handler, optionally failing or panicking.
    struct RecordingHandler {
        kind: JobKind,
        seen: Arc<StdMutex<Vec<Uuid>>>,
        behaviour: Behaviour,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run(&self, ctx: JobContext) -> Result<JobOutput, HandlerError> {
            self.seen.lock().unwrap().push(ctx.job_id);
            ctx.report(50.0, "Halfway").await;
            match self.behaviour {
                Behaviour::Succeed => Ok(JobOutput::Stems {
                    stems: BTreeMap::from([("vocals".to_string(), "vocals.mp3".to_string())]),
                    format: "mp3".into(),
                }),
                Behaviour::Fail => Err(HandlerError::Failed("E".repeat(MAX_MESSAGE_LEN * 3))),
                Behaviour::Panic => panic!("demucs exploded"),
            }
        }
    }

    /// Blocks until released, so tests can observe the `Processing` state.
    struct GateHandler {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for GateHandler {
        fn kind(&self) -> JobKind {
            JobKind::Karaoke
        }

        async fn run(&self, _ctx: JobContext) -> Result<JobOutput, HandlerError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(JobOutput::Karaoke {
                tracks: BTreeMap::new(),
                format: "wav".into(),
            })
        }
    }

    fn stems_request() -> JobRequest {
        JobRequest::Stems {
            source: AudioSource::Upload {
                file_name: "in.mp3".into(),
            },
            output_format: OutputFormat::Mp3,
            stems: StemSelection::All,
        }
    }

    fn karaoke_request() -> JobRequest {
        JobRequest::Karaoke {
            source: AudioSource::Upload {
                file_name: "in.mp3".into(),
            },
            output_format: OutputFormat::Wav,
        }
    }

    fn scheduler() -> (Arc<Scheduler>, TempDir) {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(
            Arc::new(JobRegistry::new(dir.path())),
            Arc::new(HandlerRegistry::new()),
        );
        (Arc::new(scheduler), dir)
    }

    async fn recording(
        scheduler: &Scheduler,
        kind: JobKind,
        behaviour: Behaviour,
    ) -> Arc<StdMutex<Vec<Uuid>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        scheduler
            .handlers()
            .register(Arc::new(RecordingHandler {
                kind,
                seen: Arc::clone(&seen),
                behaviour,
            }))
            .await;
        seen
    }

    async fn wait_terminal(scheduler: &Scheduler, id: Uuid) -> Job {
        tokio::time::timeout(WAIT, async {
            loop {
                let job = scheduler.get_job(id).await.unwrap();
                if job.status.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not finish")
    }

    #[tokio::test]
    async fn single_worker_runs_jobs_in_admission_order() {
        let (scheduler, _dir) = scheduler();
        let seen = recording(&scheduler, JobKind::Stems, Behaviour::Succeed).await;

        let a = scheduler.create_job(stems_request()).await.unwrap();
        let b = scheduler.create_job(stems_request()).await.unwrap();
        let c = scheduler.create_job(stems_request()).await.unwrap();

        let cancel = CancellationToken::new();
        let pool = scheduler.start_workers(1, cancel).unwrap();
        assert_eq!(pool.size(), 1);

        for id in [a.id, b.id, c.id] {
            let job = wait_terminal(&scheduler, id).await;
            assert_eq!(job.status, JobStatus::Done);
            assert_eq!(job.progress, 100.0);
            assert_eq!(job.message, "Complete!");
            assert!(job.completed_at.is_some());
            assert!(matches!(job.result, Some(JobOutput::Stems { .. })));
        }

        assert_eq!(*seen.lock().unwrap(), vec![a.id, b.id, c.id]);
        pool.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn failing_handler_records_error_and_next_job_still_runs() {
        let (scheduler, _dir) = scheduler();
        recording(&scheduler, JobKind::Stems, Behaviour::Fail).await;
        let karaoke_seen = recording(&scheduler, JobKind::Karaoke, Behaviour::Succeed).await;

        let failing = scheduler.create_job(stems_request()).await.unwrap();
        let next = scheduler.create_job(karaoke_request()).await.unwrap();

        let pool = scheduler.start_workers(1, CancellationToken::new()).unwrap();

        let failed = wait_terminal(&scheduler, failing.id).await;
        assert_eq!(failed.status, JobStatus::Error);
        assert!(!failed.message.is_empty());
        assert!(failed.message.chars().count() <= MAX_MESSAGE_LEN);
        assert!(failed.completed_at.is_some());
        assert!(failed.result.is_none());

        let done = wait_terminal(&scheduler, next.id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(*karaoke_seen.lock().unwrap(), vec![next.id]);

        pool.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn missing_handler_fails_without_side_effects() {
        let (scheduler, _dir) = scheduler();
        let stems_seen = recording(&scheduler, JobKind::Stems, Behaviour::Succeed).await;

        let orphan = scheduler.create_job(karaoke_request()).await.unwrap();
        let pool = scheduler.start_workers(2, CancellationToken::new()).unwrap();

        let job = wait_terminal(&scheduler, orphan.id).await;
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.message, "No handler for job type: karaoke");
        assert!(job.completed_at.is_some());
        assert_eq!(job.progress, 0.0);
        assert!(stems_seen.lock().unwrap().is_empty());

        pool.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_worker() {
        let (scheduler, _dir) = scheduler();
        recording(&scheduler, JobKind::Stems, Behaviour::Panic).await;
        recording(&scheduler, JobKind::Karaoke, Behaviour::Succeed).await;

        let crashing = scheduler.create_job(stems_request()).await.unwrap();
        let next = scheduler.create_job(karaoke_request()).await.unwrap();
        let pool = scheduler.start_workers(1, CancellationToken::new()).unwrap();

        let crashed = wait_terminal(&scheduler, crashing.id).await;
        assert_eq!(crashed.status, JobStatus::Error);
        assert!(crashed.message.contains("demucs exploded"));

        assert_eq!(wait_terminal(&scheduler, next.id).await.status, JobStatus::Done);
        pool.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn processing_job_leaves_queue_positions() {
        let (scheduler, _dir) = scheduler();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        scheduler
            .handlers()
            .register(Arc::new(GateHandler {
                started: Arc::clone(&started),
                release: Arc::clone(&release),
            }))
            .await;

        let a = scheduler.create_job(karaoke_request()).await.unwrap();
        let b = scheduler.create_job(karaoke_request()).await.unwrap();
        let pool = scheduler.start_workers(1, CancellationToken::new()).unwrap();

        tokio::time::timeout(WAIT, started.notified()).await.unwrap();
        let running = scheduler.get_job(a.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Processing);
        assert_eq!(running.message, "Processing...");
        assert!(running.completed_at.is_none());
        assert_eq!(scheduler.queue_position(a.id).await, 0);
        assert_eq!(scheduler.queue_position(b.id).await, 1);

        release.notify_one();
        assert_eq!(wait_terminal(&scheduler, a.id).await.status, JobStatus::Done);

        tokio::time::timeout(WAIT, started.notified()).await.unwrap();
        release.notify_one();
        assert_eq!(wait_terminal(&scheduler, b.id).await.status, JobStatus::Done);

        pool.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn unknown_id_on_queue_is_discarded() {
        let (scheduler, _dir) = scheduler();
        recording(&scheduler, JobKind::Stems, Behaviour::Succeed).await;

        scheduler.enqueue(Uuid::new_v4()).unwrap();
        let real = scheduler.create_job(stems_request()).await.unwrap();
        let pool = scheduler.start_workers(1, CancellationToken::new()).unwrap();

        assert_eq!(wait_terminal(&scheduler, real.id).await.status, JobStatus::Done);
        pool.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers_promptly() {
        let (scheduler, _dir) = scheduler();
        let pool = scheduler.start_workers(3, CancellationToken::new()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), pool.shutdown(Duration::from_secs(30)))
            .await
            .expect("idle workers should stop on cancellation");
    }

    #[tokio::test]
    async fn shutdown_abandons_stuck_handler_after_grace() {
        let (scheduler, _dir) = scheduler();
        let started = Arc::new(Notify::new());
        scheduler
            .handlers()
            .register(Arc::new(GateHandler {
                started: Arc::clone(&started),
                release: Arc::new(Notify::new()),
            }))
            .await;

        let job = scheduler.create_job(karaoke_request()).await.unwrap();
        let pool = scheduler.start_workers(1, CancellationToken::new()).unwrap();
        tokio::time::timeout(WAIT, started.notified()).await.unwrap();

        tokio::time::timeout(WAIT, pool.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown should not wait on a stuck handler");
        assert_eq!(
            scheduler.get_job(job.id).await.unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_are_each_delivered_once() {
        const JOBS: usize = 24;
        let (scheduler, _dir) = scheduler();
        let seen = recording(&scheduler, JobKind::Stems, Behaviour::Succeed).await;
        let pool = scheduler.start_workers(3, CancellationToken::new()).unwrap();

        let admissions = (0..JOBS).map(|_| {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.create_job(stems_request()).await.unwrap().id })
        });
        let mut created: Vec<Uuid> = futures::future::join_all(admissions)
            .await
            .into_iter()
            .map(|admitted| admitted.unwrap())
            .collect();

        for id in &created {
            assert_eq!(wait_terminal(&scheduler, *id).await.status, JobStatus::Done);
        }

        created.sort();
        created.dedup();
        assert_eq!(created.len(), JOBS);

        let mut delivered = seen.lock().unwrap().clone();
        delivered.sort();
        assert_eq!(delivered, created);

        pool.shutdown(WAIT).await;
    }
}
