//! Queue broker interface and its backends.

mod http;
mod memory;
mod spool;

use crate::config::{QueueBackend, QueueConfig};
use crate::dispatcher::Job;
use async_trait::async_trait;
use std::sync::Arc;

pub use self::http::HttpQueue;
pub use self::memory::MemoryQueue;
pub use self::spool::SpoolQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue rejected job with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable job queue. `submit` returning `Ok` means the broker owns the job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, job: &Job) -> Result<(), QueueError>;
}

/// Build the configured backend.
pub async fn from_config(config: &QueueConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    match config.backend {
        QueueBackend::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("queue.endpoint is required for the http backend"))?;
            log::info!("Submitting jobs to {endpoint}");
            Ok(Arc::new(HttpQueue::new(endpoint, config.timeout_seconds)?))
        }
        QueueBackend::Spool => {
            let dir = config
                .dir
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("queue.dir is required for the spool backend"))?;
            let queue = SpoolQueue::new(dir.clone());
            queue.prepare().await?;
            log::info!("Spooling jobs to {}", dir.display());
            Ok(Arc::new(queue))
        }
    }
}
