use super::{JobQueue, QueueError};
use crate::dispatcher::Job;
use async_trait::async_trait;
use std::sync::Mutex;

/// In-process queue for tests and dry runs. Jobs are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<Job>>,
    attempts: Mutex<usize>,
    fail_after: Option<usize>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the first `accepted` submissions and fail every later one.
    pub fn failing_after(accepted: usize) -> Self {
        Self {
            fail_after: Some(accepted),
            ..Self::default()
        }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().map(|n| *n).unwrap_or_default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(&self, job: &Job) -> Result<(), QueueError> {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            *attempts += 1;
            *attempts
        };

        if matches!(self.fail_after, Some(limit) if attempt > limit) {
            return Err(QueueError::Unavailable("queue is refusing jobs".to_string()));
        }

        self.jobs
            .lock()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .push(job.clone());
        Ok(())
    }
}
