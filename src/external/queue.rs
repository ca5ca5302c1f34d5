use anyhow::Result;
use parking_lot::Mutex;

use crate::model::Job;

/// Fire-and-forget hand-off to downstream workers.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, job: Job) -> Result<()>;
}

/// Records published jobs in order.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().clone()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Job) -> bool,
    {
        self.jobs.lock().iter().filter(|job| predicate(job)).count()
    }

    pub fn clear(&self) {
        self.jobs.lock().clear();
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryJobQueue {
    async fn publish(&self, job: Job) -> Result<()> {
        log::debug!("publishing {} job", job.queue());
        self.jobs.lock().push(job);
        Ok(())
    }
}
