//! Job registry: the single in-memory store of job records.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::JobError;
use crate::worker::job::{Job, JobRequest};
use crate::worker::state::JobStatus;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    next_seq: u64,
}

/// Owns every job record and its output directory under a common root.
pub struct JobRegistry {
    inner: RwLock<Inner>,
    root: PathBuf,
}

impl JobRegistry {
    /// Create a registry storing job directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            root: root.into(),
        }
    }

    /// Root directory holding one directory per job.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh id, create its output directory and store a `Queued` record.
    pub async fn create(&self, params: JobRequest) -> Result<Job, JobError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| JobError::Storage {
                path: self.root.clone(),
                source,
            })?;

        // `create_dir` fails on an existing directory, so a colliding id is never handed out twice.
        let (id, output_dir) = loop {
            let id = Uuid::new_v4();
            let dir = self.root.join(id.simple().to_string());
            match fs::create_dir(&dir).await {
                Ok(()) => break (id, dir),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(JobError::Storage { path: dir, source }),
            }
        };

        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let job = Job::new(id, inner.next_seq, params, output_dir);
        inner.jobs.insert(id, job.clone());
        drop(inner);

        tracing::debug!(job_id = %id, kind = %job.job_type, "Job created");
        Ok(job)
    }

    /// Get a snapshot of a job.
    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.inner.read().await.jobs.get(&id).cloned()
    }

    /// Mutate a job record in place.
    pub async fn update<F, R>(&self, id: Uuid, f: F) -> Result<R, JobError>
    where
        F: FnOnce(&mut Job) -> R,
    {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        Ok(f(job))
    }

    /// Remove a record. The output directory is left to the caller.
    pub async fn remove(&self, id: Uuid) -> Option<Job> {
        self.inner.write().await.jobs.remove(&id)
    }

    /// Snapshot of all jobs.
    pub async fn list(&self) -> Vec<Job> {
        self.inner.read().await.jobs.values().cloned().collect()
    }

    /// 1-based rank among queued jobs by admission order; 0 when absent or not queued.
    pub async fn queue_position(&self, id: Uuid) -> usize {
        let inner = self.inner.read().await;
        let Some(job) = inner.jobs.get(&id) else {
            return 0;
        };
        if job.status != JobStatus::Queued {
            return 0;
        }

        let ahead = inner
            .jobs
            .values()
            .filter(|other| {
                other.status == JobStatus::Queued
                    && (other.created_at, other.seq) < (job.created_at, job.seq)
            })
            .count();
        ahead + 1
    }

    /// Ids of terminal jobs whose retention window has elapsed at `now`.
    pub async fn expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.is_expired(now, retention))
            .map(|job| job.id)
            .collect()
    }

    /// Count of jobs per status.
    pub async fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read().await;

        let mut summary = RegistrySummary::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Queued => summary.queued += 1,
                JobStatus::Processing => summary.processing += 1,
                JobStatus::Done => summary.done += 1,
                JobStatus::Error => summary.error += 1,
            }
        }

        summary.total = inner.jobs.len();
        summary
    }
}

/// Summary of all job records.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::media::Platform;
    use crate::worker::job::{JobKind, MediaKind};
    use tempfile::TempDir;

    fn request() -> JobRequest {
        JobRequest::Download {
            url: "https://www.youtube.com/watch?v=abc".into(),
            format_id: "best".into(),
            media: MediaKind::Video,
            platform: Platform::Youtube,
        }
    }

    fn registry() -> (JobRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        (JobRegistry::new(dir.path().join("jobs")), dir)
    }

    #[tokio::test]
    async fn create_job() {
        let (registry, _dir) = registry();
        let job = registry.create(request()).await.unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.job_type, JobKind::Download);
        assert!(job.output_dir.is_dir());
        assert!(job.output_dir.starts_with(registry.root()));

        let fetched = registry.get(job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[tokio::test]
    async fn get_unknown_is_none() {
        let (registry, _dir) = registry();
        assert!(registry.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn update_and_remove() {
        let (registry, _dir) = registry();
        let job = registry.create(request()).await.unwrap();

        registry
            .update(job.id, |j| j.transition_to(JobStatus::Processing, "Processing..."))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            registry.get(job.id).await.unwrap().status,
            JobStatus::Processing
        );

        let removed = registry.remove(job.id).await.unwrap();
        assert_eq!(removed.id, job.id);
        assert!(registry.get(job.id).await.is_none());
        assert!(matches!(
            registry.update(job.id, |_| ()).await,
            Err(JobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn queue_positions_follow_admission_order() {
        let (registry, _dir) = registry();
        let a = registry.create(request()).await.unwrap();
        let b = registry.create(request()).await.unwrap();
        let c = registry.create(request()).await.unwrap();

        assert_eq!(registry.queue_position(a.id).await, 1);
        assert_eq!(registry.queue_position(b.id).await, 2);
        assert_eq!(registry.queue_position(c.id).await, 3);

        registry
            .update(a.id, |j| j.transition_to(JobStatus::Processing, "Processing..."))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registry.queue_position(a.id).await, 0);
        assert_eq!(registry.queue_position(b.id).await, 1);
        assert_eq!(registry.queue_position(c.id).await, 2);
    }

    #[tokio::test]
    async fn queue_position_of_unknown_is_zero() {
        let (registry, _dir) = registry();
        assert_eq!(registry.queue_position(Uuid::new_v4()).await, 0);
    }

    #[tokio::test]
    async fn summary_counts_statuses() {
        let (registry, _dir) = registry();
        registry.create(request()).await.unwrap();
        let b = registry.create(request()).await.unwrap();
        registry
            .update(b.id, |j| j.transition_to(JobStatus::Processing, "Processing..."))
            .await
            .unwrap()
            .unwrap();

        let summary = registry.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.processing, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_distinct_jobs() {
        let (registry, _dir) = registry();
        let registry = Arc::new(registry);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move { registry.create(request()).await.unwrap().id });
        }

        let mut ids = HashSet::new();
        while let Some(id) = tasks.join_next().await {
            assert!(ids.insert(id.unwrap()));
        }

        assert_eq!(ids.len(), 64);
        assert_eq!(registry.summary().await.queued, 64);

        let mut positions: Vec<usize> = Vec::new();
        for id in &ids {
            positions.push(registry.queue_position(*id).await);
        }
        positions.sort_unstable();
        assert_eq!(positions, (1..=64).collect::<Vec<_>>());
    }
}
