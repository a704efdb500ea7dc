//! Job registry for asynchronous video-annotation work.
//!
//! One mutex guards the whole map; every access takes and releases it
//! briefly, never across decode or inference. Jobs move `Running -> Done`
//! or `Running -> Error` exactly once; terminal states absorb any further
//! writes as no-ops. Completed entries and their output artifacts are never
//! evicted — the registry lives for the process lifetime, so long-running
//! deployments accumulate job records until restart.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Done,
    Error,
}

/// Mutable job record. Owned by exactly one worker; read through the
/// registry by arbitrarily many pollers.
#[derive(Debug, Clone)]
pub struct VideoJob {
    pub status: JobStatus,
    pub processed: u64,
    pub total: Option<u64>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub source_filename: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub status: JobStatus,
    pub processed: u64,
    pub total: Option<u64>,
    pub percent: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The three failure states a job query can land in. They stay
/// distinguishable all the way to the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobQueryError {
    #[error("job not found")]
    NotFound,
    #[error("job not finished")]
    NotReady,
    #[error("result expired or missing")]
    Gone,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, VideoJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh job in `Running` state and return its id.
    pub fn create(&self, source_filename: &str, total: Option<u64>) -> String {
        let job_id = uuid::Uuid::new_v4().simple().to_string();
        let job = VideoJob {
            status: JobStatus::Running,
            processed: 0,
            total,
            error: None,
            output_path: None,
            source_filename: source_filename.to_string(),
            created_at: Utc::now(),
        };
        let mut jobs = self.lock();
        jobs.insert(job_id.clone(), job);
        metrics::gauge!("fallwatch_jobs_tracked").set(jobs.len() as f64);
        debug!(job = %job_id, "registered annotation job");
        job_id
    }

    pub fn set_total(&self, job_id: &str, total: Option<u64>) {
        if let Some(job) = self.lock().get_mut(job_id) {
            if job.status == JobStatus::Running && total.is_some() {
                job.total = total;
            }
        }
    }

    /// Advance the processed-frame counter. Counts only move forward and
    /// only while the job is running.
    pub fn set_progress(&self, job_id: &str, processed: u64) {
        if let Some(job) = self.lock().get_mut(job_id) {
            if job.status == JobStatus::Running && processed > job.processed {
                job.processed = processed;
            }
        }
    }

    pub fn finish(&self, job_id: &str, output_path: PathBuf) {
        if let Some(job) = self.lock().get_mut(job_id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Done;
                job.output_path = Some(output_path);
                metrics::counter!("fallwatch_jobs_finished_total").increment(1);
            }
        }
    }

    pub fn fail(&self, job_id: &str, message: impl Into<String>) {
        if let Some(job) = self.lock().get_mut(job_id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Error;
                job.error = Some(message.into());
                metrics::counter!("fallwatch_jobs_failed_total").increment(1);
            }
        }
    }

    /// Poll one job. Percent is clamped to `[0, 100]` and absent while the
    /// total frame count is unknown.
    pub fn progress(&self, job_id: &str) -> Result<JobProgress, JobQueryError> {
        let jobs = self.lock();
        let job = jobs.get(job_id).ok_or(JobQueryError::NotFound)?;
        let percent = job.total.filter(|&t| t > 0).map(|total| {
            ((job.processed as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
        });
        Ok(JobProgress {
            status: job.status,
            processed: job.processed,
            total: job.total,
            percent,
            error: job.error.clone(),
            created_at: job.created_at,
        })
    }

    /// Resolve the output artifact of a finished job. The path is checked on
    /// every call so a reclaimed file degrades to `Gone`, never to a stale
    /// success.
    pub fn result(&self, job_id: &str) -> Result<(PathBuf, String), JobQueryError> {
        let jobs = self.lock();
        let job = jobs.get(job_id).ok_or(JobQueryError::NotFound)?;
        if job.status != JobStatus::Done {
            return Err(JobQueryError::NotReady);
        }
        match &job.output_path {
            Some(path) if path.exists() => Ok((path.clone(), job.source_filename.clone())),
            _ => Err(JobQueryError::Gone),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VideoJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Worker threads tracked for join-on-shutdown.
#[derive(Default)]
pub struct WorkerSet {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, handle: thread::JoinHandle<()>) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }

    /// Join every tracked worker within the deadline. Stragglers are
    /// abandoned rather than killed; the count of abandoned threads is
    /// returned.
    pub fn join_with_timeout(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return 0,
        };
        loop {
            handles.retain(|handle| !handle.is_finished());
            if handles.is_empty() {
                return 0;
            }
            if Instant::now() >= deadline {
                warn!(abandoned = handles.len(), "workers did not exit before deadline");
                return handles.len();
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn fresh_job_polls_running_with_zero_progress() {
        let registry = JobRegistry::new();
        let id = registry.create("clip.mp4", Some(120));
        let progress = registry.progress(&id).unwrap();
        assert_eq!(progress.status, JobStatus::Running);
        assert_eq!(progress.processed, 0);
        assert_eq!(progress.total, Some(120));
        assert_eq!(progress.percent, Some(0.0));
        assert!(progress.created_at <= Utc::now());
    }

    #[test]
    fn percent_is_absent_without_total_and_clamped_with_one() {
        let registry = JobRegistry::new();
        let id = registry.create("clip.mp4", None);
        assert_eq!(registry.progress(&id).unwrap().percent, None);

        registry.set_total(&id, Some(10));
        registry.set_progress(&id, 25);
        assert_eq!(registry.progress(&id).unwrap().percent, Some(100.0));
    }

    #[test]
    fn progress_is_monotone() {
        let registry = JobRegistry::new();
        let id = registry.create("clip.mp4", Some(100));
        registry.set_progress(&id, 40);
        registry.set_progress(&id, 10);
        assert_eq!(registry.progress(&id).unwrap().processed, 40);
    }

    #[test]
    fn result_before_done_is_not_ready() {
        let registry = JobRegistry::new();
        let id = registry.create("clip.mp4", None);
        assert_eq!(registry.result(&id), Err(JobQueryError::NotReady));
    }

    #[test]
    fn finished_job_result_is_repeatable() {
        let registry = JobRegistry::new();
        let id = registry.create("clip.mp4", Some(5));
        let artifact = tempfile::NamedTempFile::new().unwrap();
        registry.finish(&id, artifact.path().to_path_buf());

        for _ in 0..3 {
            let (path, filename) = registry.result(&id).unwrap();
            assert_eq!(path, artifact.path());
            assert_eq!(filename, "clip.mp4");
        }
        assert_eq!(registry.progress(&id).unwrap().status, JobStatus::Done);
    }

    #[test]
    fn reclaimed_output_is_gone_not_missing() {
        let registry = JobRegistry::new();
        let id = registry.create("clip.mp4", None);
        let artifact = tempfile::NamedTempFile::new().unwrap();
        let path = artifact.path().to_path_buf();
        registry.finish(&id, path);
        drop(artifact);
        assert_eq!(registry.result(&id), Err(JobQueryError::Gone));
    }

    #[test]
    fn unknown_job_is_not_found_everywhere() {
        let registry = JobRegistry::new();
        assert_eq!(registry.progress("missing").unwrap_err(), JobQueryError::NotFound);
        assert_eq!(registry.result("missing").unwrap_err(), JobQueryError::NotFound);
    }

    #[test]
    fn terminal_states_absorb_further_writes() {
        let registry = JobRegistry::new();
        let id = registry.create("clip.mp4", Some(10));
        registry.fail(&id, "boom");

        registry.set_progress(&id, 9);
        registry.finish(&id, PathBuf::from("/tmp/late.mp4"));
        registry.fail(&id, "again");

        let progress = registry.progress(&id).unwrap();
        assert_eq!(progress.status, JobStatus::Error);
        assert_eq!(progress.processed, 0);
        assert_eq!(progress.error.as_deref(), Some("boom"));
    }

    #[test]
    fn stop_flag_drives_workers_out_within_the_deadline() {
        let workers = WorkerSet::new();
        let stop = Arc::new(AtomicBool::new(false));
        for _ in 0..3 {
            let stop = stop.clone();
            workers.track(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(5));
                }
            }));
        }
        stop.store(true, Ordering::SeqCst);
        assert_eq!(workers.join_with_timeout(Duration::from_secs(2)), 0);
    }

    #[test]
    fn stuck_workers_are_abandoned_not_awaited() {
        let workers = WorkerSet::new();
        workers.track(thread::spawn(|| {
            thread::sleep(Duration::from_secs(30));
        }));
        let started = Instant::now();
        assert_eq!(workers.join_with_timeout(Duration::from_millis(150)), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
