//! Long-running operation tracking (spec §4.D / §5.4).
//!
//! Directly grounded in the teacher's `daemon.rs` run-tracking: `JobState`
//! mirrors `RunStatus`, `submit`/`cancel` mirror `create_run`/`cancel_run`
//! idempotency, and the background task spawned per job carries the same
//! "terminal guard" — `if job.status.is_terminal() { return; }` — that
//! stops a late result from clobbering a job a client already cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub kind: String,
    pub status: JobStatus,
    pub progress_pct: Option<f32>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<serde_json::Value>,
}

struct JobEntry {
    record: JobRecord,
    cancel_flag: Arc<AtomicBool>,
    created_at: Instant,
    finished_at: Option<Instant>,
}

/// A handle a running job's body uses to report progress and check for
/// cancellation, the counterpart of the teacher's `RunEvent` sink.
pub struct JobHandle {
    job_id: String,
    engine: Arc<JobEngine>,
    cancel_flag: Arc<AtomicBool>,
}

impl JobHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    pub async fn report_progress(&self, pct: f32) {
        self.engine.set_progress(&self.job_id, pct).await;
    }
}

pub struct JobEngine {
    jobs: Mutex<HashMap<String, JobEntry>>,
    result_ttl: Duration,
}

impl JobEngine {
    pub fn new(result_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            result_ttl,
        })
    }

    /// Register a new job in `Queued` state and hand back a handle the
    /// caller uses inside its spawned task, plus the job id to return to
    /// the client immediately.
    pub async fn submit(self: &Arc<Self>, kind: impl Into<String>) -> (String, JobHandle) {
        let job_id = Uuid::now_v7().to_string();
        let now = now_rfc3339();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let record = JobRecord {
            job_id: job_id.clone(),
            kind: kind.into(),
            status: JobStatus::Queued,
            progress_pct: Some(0.0),
            created_at: now.clone(),
            updated_at: now,
            result: None,
            error: None,
        };
        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            job_id.clone(),
            JobEntry {
                record,
                cancel_flag: cancel_flag.clone(),
                created_at: Instant::now(),
                finished_at: None,
            },
        );
        (
            job_id.clone(),
            JobHandle {
                job_id,
                engine: self.clone(),
                cancel_flag,
            },
        )
    }

    pub async fn mark_running(&self, job_id: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(job_id) {
            if !entry.record.status.is_terminal() {
                entry.record.status = JobStatus::Running;
                entry.record.updated_at = now_rfc3339();
            }
        }
    }

    async fn set_progress(&self, job_id: &str, pct: f32) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(job_id) {
            if !entry.record.status.is_terminal() {
                entry.record.progress_pct = Some(pct.clamp(0.0, 100.0));
                entry.record.updated_at = now_rfc3339();
            }
        }
    }

    /// Record a job's outcome. A no-op if the job is already terminal
    /// (terminal guard) — a cancellation always wins over a late result.
    pub async fn complete(&self, job_id: &str, status: JobStatus, result: Option<serde_json::Value>, error: Option<serde_json::Value>) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(job_id) {
            if entry.record.status.is_terminal() {
                debug!(job_id, "dropping late completion for already-terminal job");
                return;
            }
            entry.record.status = status;
            entry.record.progress_pct = Some(100.0);
            entry.record.updated_at = now_rfc3339();
            entry.record.result = result;
            entry.record.error = error;
            entry.finished_at = Some(Instant::now());
        }
    }

    pub async fn get(&self, job_id: &str) -> Result<JobRecord> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| Error::NotFound(format!("no such job '{job_id}'")))
    }

    pub async fn list(&self) -> Vec<JobRecord> {
        self.jobs.lock().await.values().map(|e| e.record.clone()).collect()
    }

    /// Idempotent: cancelling an already-terminal job is a no-op success,
    /// matching the teacher's `cancel_run` idempotency.
    ///
    /// Cancellation is best-effort (spec §4.E): this only raises
    /// `cancel_flag` for a `Running` job, it does not itself declare the job
    /// terminal. The job's own task observes the flag and calls `complete`
    /// with whatever actually happened — `Cancelled` if it bails out in
    /// time, `Succeeded` if the underlying operation had already committed.
    /// A `Queued` job has no task watching the flag yet, so cancelling one
    /// transitions it to `Cancelled` directly.
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("no such job '{job_id}'")))?;
        if entry.record.status.is_terminal() {
            return Ok(entry.record.clone());
        }
        entry.cancel_flag.store(true, Ordering::SeqCst);
        if entry.record.status == JobStatus::Queued {
            entry.record.status = JobStatus::Cancelled;
            entry.record.updated_at = now_rfc3339();
            entry.finished_at = Some(Instant::now());
        }
        Ok(entry.record.clone())
    }

    async fn sweep(&self) {
        let mut jobs = self.jobs.lock().await;
        let ttl = self.result_ttl;
        let before = jobs.len();
        jobs.retain(|_, e| match e.finished_at {
            Some(finished) => finished.elapsed() <= ttl,
            None => true,
        });
        let removed = before - jobs.len();
        if removed > 0 {
            warn!(removed, "job result TTL sweep reaped finished jobs");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                engine.sweep().await;
            }
        })
    }
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(std::time::SystemTime::now()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_then_complete() {
        let engine = JobEngine::new(Duration::from_secs(60));
        let (job_id, _handle) = engine.submit("vm_management.start").await;
        engine.mark_running(&job_id).await;
        assert_eq!(engine.get(&job_id).await.unwrap().status, JobStatus::Running);
        engine.complete(&job_id, JobStatus::Succeeded, Some(serde_json::json!({"ok": true})), None).await;
        let rec = engine.get(&job_id).await.unwrap();
        assert_eq!(rec.status, JobStatus::Succeeded);
        assert_eq!(rec.progress_pct, Some(100.0));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let engine = JobEngine::new(Duration::from_secs(60));
        let (job_id, _handle) = engine.submit("vm_management.stop").await;
        engine.cancel(&job_id).await.unwrap();
        let again = engine.cancel(&job_id).await.unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminal_guard_drops_late_completion() {
        let engine = JobEngine::new(Duration::from_secs(60));
        let (job_id, _handle) = engine.submit("vm_management.delete").await;
        engine.cancel(&job_id).await.unwrap();
        engine.complete(&job_id, JobStatus::Succeeded, None, None).await;
        let rec = engine.get(&job_id).await.unwrap();
        assert_eq!(rec.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_a_running_job_only_raises_the_flag() {
        let engine = JobEngine::new(Duration::from_secs(60));
        let (job_id, handle) = engine.submit("vm_management.clone").await;
        engine.mark_running(&job_id).await;
        let cancelled = engine.cancel(&job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Running, "a running job must stay non-terminal until its task observes cancellation");
        assert!(handle.is_cancelled());

        // The task notices the flag too late — the operation already
        // committed on the VirtualBox side — and reports success.
        engine.complete(&job_id, JobStatus::Succeeded, Some(serde_json::json!({"ok": true})), None).await;
        let rec = engine.get(&job_id).await.unwrap();
        assert_eq!(rec.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn handle_reflects_cancellation() {
        let engine = JobEngine::new(Duration::from_secs(60));
        let (job_id, handle) = engine.submit("vm_management.start").await;
        assert!(!handle.is_cancelled());
        engine.cancel(&job_id).await.unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn sweep_reaps_finished_jobs_past_ttl() {
        let engine = JobEngine::new(Duration::from_millis(10));
        let (job_id, _handle) = engine.submit("vm_management.start").await;
        engine.complete(&job_id, JobStatus::Succeeded, None, None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.sweep().await;
        assert!(engine.get(&job_id).await.is_err());
    }
}
