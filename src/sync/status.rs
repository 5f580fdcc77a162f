use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::types::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Data was already current; nothing fetched.
    Fresh,
    Completed,
    /// Stopped at a shutdown signal; the checkpoint resumes it.
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: JobKind,
    pub interval_secs: u64,
    pub running: bool,
    pub queued: bool,
    pub current_batch: usize,
    pub total_batches: usize,
    pub last_outcome: Option<Outcome>,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Records written by the most recent pass.
    pub last_pass_records: u64,
    pub skipped_batches: u64,
    pub total_records: u64,
}

impl JobStatus {
    fn new(job: JobKind, every: Duration) -> Self {
        Self {
            job,
            interval_secs: every.as_secs(),
            running: false,
            queued: false,
            current_batch: 0,
            total_batches: 0,
            last_outcome: None,
            last_error: None,
            last_checked_at: None,
            last_completed_at: None,
            last_pass_records: 0,
            skipped_batches: 0,
            total_records: 0,
        }
    }
}

/// Published per-job status, read by the API.
#[derive(Debug, Default)]
pub struct SyncStatusBoard {
    jobs: DashMap<JobKind, JobStatus>,
}

impl SyncStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: JobKind, every: Duration) {
        self.jobs.insert(job, JobStatus::new(job, every));
    }

    pub fn get(&self, job: JobKind) -> Option<JobStatus> {
        self.jobs.get(&job).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<JobStatus> {
        let mut v: Vec<JobStatus> = self.jobs.iter().map(|e| e.value().clone()).collect();
        v.sort_by_key(|s| JobKind::ALL.iter().position(|k| *k == s.job));
        v
    }

    pub fn update(&self, job: JobKind, f: impl FnOnce(&mut JobStatus)) {
        if let Some(mut s) = self.jobs.get_mut(&job) {
            f(&mut s);
        }
    }

    pub fn checked(&self, job: JobKind, fresh: bool) {
        self.update(job, |s| {
            s.last_checked_at = Some(Utc::now());
            if fresh {
                s.last_outcome = Some(Outcome::Fresh);
            }
        });
    }

    pub fn set_queued(&self, job: JobKind, queued: bool) {
        self.update(job, |s| s.queued = queued);
    }

    pub fn started(&self, job: JobKind) {
        self.update(job, |s| {
            s.running = true;
            s.queued = false;
        });
    }

    pub fn progress(&self, job: JobKind, current: usize, total: usize) {
        self.update(job, |s| {
            s.current_batch = current;
            s.total_batches = total;
        });
    }

    pub fn finished(&self, job: JobKind, outcome: Outcome, records: u64, skipped: u64, error: Option<String>) {
        self.update(job, |s| {
            s.running = false;
            s.last_outcome = Some(outcome);
            s.last_pass_records = records;
            s.skipped_batches += skipped;
            s.total_records += records;
            if outcome == Outcome::Completed {
                s.last_completed_at = Some(Utc::now());
                s.last_error = None;
            }
            if error.is_some() {
                s.last_error = error;
            }
        });
    }
}
