//! The single remote-API lock shared by every sync job.
//!
//! At most one job holds it. A job that finds it held is queued once (FIFO); on
//! release the lock passes straight to the queue head, so a released lock is never
//! observable as free while someone is waiting.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::types::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Queued,
    AlreadyQueued,
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<JobKind>,
    queue: VecDeque<JobKind>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockView {
    pub holder: Option<JobKind>,
    pub queue: Vec<JobKind>,
}

#[derive(Debug, Default)]
pub struct ApiLock {
    state: Mutex<LockState>,
}

impl ApiLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, or join the queue if someone else holds it.
    /// A job that already holds the lock is granted again.
    pub fn try_acquire(&self, job: JobKind) -> Acquire {
        let mut st = self.lock();
        match st.holder {
            None => {
                st.holder = Some(job);
                Acquire::Granted
            }
            Some(h) if h == job => Acquire::Granted,
            Some(_) if st.queue.contains(&job) => Acquire::AlreadyQueued,
            Some(_) => {
                st.queue.push_back(job);
                Acquire::Queued
            }
        }
    }

    /// Release the lock held by `job` and hand it to the next queued job.
    /// Returns the new holder. A release by a non-holder changes nothing.
    pub fn release(&self, job: JobKind) -> Option<JobKind> {
        let mut st = self.lock();
        if st.holder != Some(job) {
            return None;
        }
        st.holder = st.queue.pop_front();
        st.holder
    }

    /// Leave the lock entirely (holder or queue). Used when a job task stops.
    pub fn withdraw(&self, job: JobKind) -> Option<JobKind> {
        {
            let mut st = self.lock();
            st.queue.retain(|j| *j != job);
        }
        self.release(job)
    }

    pub fn is_held_by(&self, job: JobKind) -> bool {
        self.lock().holder == Some(job)
    }

    pub fn is_queued(&self, job: JobKind) -> bool {
        self.lock().queue.contains(&job)
    }

    pub fn view(&self) -> LockView {
        let st = self.lock();
        LockView {
            holder: st.holder,
            queue: st.queue.iter().copied().collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
