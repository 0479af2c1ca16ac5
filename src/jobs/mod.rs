use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use log::warn;

/// A queued unit of background work. Jobs are payload-free markers; the key
/// carries all the identity a worker needs (here: the chat ID), and the
/// worker re-discovers what actually needs doing when it runs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Job {
    pub kind: &'static str,
    pub key: String,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Job>,
    busy: HashSet<Job>,
}

/// In-process job queue with per-(kind, key) coalescing: a second enqueue of
/// a job that is already queued or running is dropped. Triggers and
/// execution are decoupled, so workers must tolerate waking up with nothing
/// to do.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
}

impl JobQueue {
    pub fn new() -> JobQueue {
        JobQueue::default()
    }

    /// Returns false when the job was coalesced with an existing one.
    pub fn enqueue(&self, kind: &'static str, key: &str) -> bool {
        let job = Job {
            kind,
            key: key.to_string(),
        };
        let mut state = self.state.lock().unwrap();
        if state.busy.contains(&job) {
            return false;
        }
        state.busy.insert(job.clone());
        state.queue.push_back(job);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Pops the next job and marks it in flight until the returned guard is
    /// dropped; enqueues for the same (kind, key) coalesce meanwhile.
    pub fn next(&self) -> Option<JobGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        let job = state.queue.pop_front()?;
        Some(JobGuard { queue: self, job })
    }
}

pub struct JobGuard<'a> {
    queue: &'a JobQueue,
    pub job: Job,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock().unwrap();
        state.busy.remove(&self.job);
    }
}

/// Drains the queue, running each job through `run`. Job failures are logged
/// and never abort the drain. Returns how many jobs ran.
pub fn run_pending(queue: &JobQueue, mut run: impl FnMut(&Job) -> Result<()>) -> usize {
    let mut ran = 0;
    while let Some(guard) = queue.next() {
        if let Err(err) = run(&guard.job) {
            warn!("job {}({}) failed: {err:#}", guard.job.kind, guard.job.key);
        }
        ran += 1;
    }
    ran
}
