//! Job queue for ContactForge enrichment jobs.
//!
//! [`JobQueue`] is the contract the worker pool runs against. Two backends:
//! - [`MemoryQueue`]: in-process, for tests and one-shot runs
//! - [`LibsqlQueue`]: durable, shared by every process pointing at the same file

pub mod durable;
pub mod error;
pub mod job_queue;
pub mod memory;
pub mod policy;

use std::sync::Arc;

use contactforge_shared::{MEMORY_QUEUE_TARGET, QueueConfig, RetryConfig, expand_home};

pub use durable::LibsqlQueue;
pub use error::QueueError;
pub use job_queue::{Delivery, EnqueueRequest, FailOutcome, JobQueue, QueueDepth, RetryTicket};
pub use memory::MemoryQueue;
pub use policy::RetryPolicy;

/// Build the queue named by `config.target`.
pub async fn open_queue(
    config: &QueueConfig,
    retry: &RetryConfig,
) -> Result<Arc<dyn JobQueue>, QueueError> {
    let policy = RetryPolicy::from_config(retry);
    let target = config.target.trim();

    if target.eq_ignore_ascii_case(MEMORY_QUEUE_TARGET) {
        tracing::debug!("using in-memory queue");
        return Ok(Arc::new(MemoryQueue::new(policy, config.visibility_timeout())));
    }

    let path = expand_home(target).map_err(|e| QueueError::Backend(e.to_string()))?;
    let queue = LibsqlQueue::open(
        &path,
        policy,
        config.visibility_timeout(),
        config.poll_interval(),
    )
    .await?;
    Ok(Arc::new(queue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contactforge_shared::JobId;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_target_opens_in_memory_queue() {
        let config = QueueConfig {
            target: "Memory".into(),
            ..QueueConfig::default()
        };
        let queue = open_queue(&config, &RetryConfig::default()).await.unwrap();
        let id = queue
            .enqueue(EnqueueRequest {
                job_id: JobId::new(),
                priority: 1,
                max_attempts: 1,
            })
            .await
            .unwrap();
        let delivery = queue.dequeue(Duration::from_millis(100)).await.unwrap();
        assert_eq!(delivery.map(|d| d.job_id), Some(id));
    }

    #[tokio::test]
    async fn path_target_opens_durable_queue() {
        let path = std::env::temp_dir().join(format!("cf_open_{}.db", uuid::Uuid::now_v7()));
        let config = QueueConfig {
            target: path.display().to_string(),
            ..QueueConfig::default()
        };
        let queue = open_queue(&config, &RetryConfig::default()).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
        assert!(path.exists());
    }
}
