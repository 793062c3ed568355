use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::download::DownloadReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Accepted,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// A background download and what became of it.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub playlist: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<DownloadReport>,
    pub error: Option<String>,
    #[serde(skip)]
    seq: u64,
}

/// Finished jobs kept around for queries. Jobs still in flight are never dropped.
pub const DEFAULT_FINISHED_RETENTION: usize = 100;

/// In-memory registry of background jobs, addressed by id.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    next_seq: Arc<AtomicU64>,
    retain_finished: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }

    /// Registry that keeps only the `retain_finished` most recently finished jobs.
    pub fn with_retention(retain_finished: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            retain_finished,
        }
    }

    /// Record a job and run `work` on the runtime. Returns the job id.
    pub async fn submit<F>(&self, url: &str, playlist: Option<String>, work: F) -> String
    where
        F: Future<Output = DownloadReport> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let job = Job {
            id: id.clone(),
            url: url.to_string(),
            playlist,
            status: JobStatus::Accepted,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.jobs.write().await.insert(id.clone(), job);
        tracing::info!("Job {} accepted for {}", id, url);

        let registry = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            registry
                .update(&job_id, |job| {
                    job.status = JobStatus::Running;
                    job.started_at = Some(Utc::now());
                })
                .await;

            // A panic inside `work` surfaces here as a JoinError.
            let outcome = tokio::spawn(work).await;

            registry
                .update(&job_id, |job| {
                    job.finished_at = Some(Utc::now());
                    match outcome {
                        Ok(report) => {
                            job.status = if report.success {
                                JobStatus::Succeeded
                            } else {
                                JobStatus::Failed
                            };
                            job.error = report.error.clone();
                            job.result = Some(report);
                        }
                        Err(e) => {
                            job.status = JobStatus::Failed;
                            job.error = Some(format!("Job aborted: {}", e));
                        }
                    }
                })
                .await;

            if let Some(job) = registry.get(&job_id).await {
                tracing::info!("Job {} finished: {:?}", job_id, job.status);
            }
            registry.prune_finished().await;
        });

        id
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut Job)) {
        if let Some(job) = self.jobs.write().await.get_mut(id) {
            apply(job);
        }
    }

    /// Drop the earliest finished jobs beyond the retention limit.
    async fn prune_finished(&self) {
        let mut jobs = self.jobs.write().await;
        let mut finished: Vec<((Option<DateTime<Utc>>, u64), String)> = jobs
            .values()
            .filter(|job| job.status.is_finished())
            .map(|job| ((job.finished_at, job.seq), job.id.clone()))
            .collect();
        if finished.len() <= self.retain_finished {
            return;
        }

        finished.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in finished.into_iter().skip(self.retain_finished) {
            tracing::debug!("Forgetting job {}", id);
            jobs.remove(&id);
        }
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.seq.cmp(&a.seq));
        jobs
    }
}
