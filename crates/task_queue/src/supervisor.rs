use crate::config::WorkerConfig;
use crate::error::TaskQueueError;
use crate::pool::PoolMetrics;
use crate::queue::{reclaim_if_stale, JobQueue};
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic housekeeping: exports queue depth and fails jobs whose owner vanished.
pub struct Supervisor {
	queue: Arc<dyn JobQueue>,
	config: WorkerConfig,
	metrics: PoolMetrics,
}

impl Supervisor {
	#[must_use]
	pub fn new(queue: Arc<dyn JobQueue>, config: WorkerConfig, metrics: PoolMetrics) -> Self {
		Self { queue, config, metrics }
	}

	pub async fn run(&self, cancel: CancellationToken) {
		loop {
			if let Err(e) = self.reclaim_stale_jobs().await {
				warn!(error = %e, "Stale job sweep failed");
			}
			if let Err(e) = self.update_metrics().await {
				warn!(error = %e, "Queue metrics refresh failed");
			}

			tokio::select! {
				() = cancel.cancelled() => break,
				() = sleep(self.config.heartbeat_interval) => {}
			}
		}
	}

	///
	/// # Errors
	/// Propagates broker failures
	pub async fn reclaim_stale_jobs(&self) -> Result<usize, TaskQueueError> {
		let mut reclaimed = 0;
		for job_id in self.queue.processing_jobs().await? {
			if reclaim_if_stale(self.queue.as_ref(), &job_id, self.config.stale_grace).await? {
				self.metrics.stale_reclaimed.inc();
				reclaimed += 1;
			}
		}
		if reclaimed > 0 {
			debug!(reclaimed, "Reclaimed stale jobs");
		}
		Ok(reclaimed)
	}

	async fn update_metrics(&self) -> Result<(), TaskQueueError> {
		for (priority, len) in self.queue.queue_lengths().await? {
			let len = i64::try_from(len)?;
			self.metrics.queue_length.with_label_values(&[&priority.to_string()]).set(len);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::{Job, JobPayload, JobStatus, JobType, StatusRecord};
	use crate::queue::InMemoryJobQueue;
	use chrono::Utc;
	use prometheus::Registry;
	use std::time::Duration;

	#[tokio::test]
	async fn test_supervisor_reclaims_stale_and_exports_lengths() {
		let queue = Arc::new(InMemoryJobQueue::default());
		let registry = Registry::new();
		let metrics = PoolMetrics::register(&registry).unwrap();

		let stale = Job::new(JobType::SourceSeparation, 5, JobPayload::new("a.wav", "out"), Duration::from_secs(10)).unwrap();
		let fresh = Job::new(JobType::SourceSeparation, 5, JobPayload::new("b.wav", "out"), Duration::from_secs(600)).unwrap();
		let pending = Job::new(JobType::AudioConvert, 7, JobPayload::new("c.wav", "out"), Duration::from_secs(60)).unwrap();

		let mut old = StatusRecord::processing(&stale);
		old.started_at = Some(Utc::now() - chrono::Duration::seconds(30));
		queue.update_status(&stale.id, &old).await.unwrap();
		queue.update_status(&fresh.id, &StatusRecord::processing(&fresh)).await.unwrap();
		queue.enqueue(&pending).await.unwrap();

		let supervisor = Supervisor::new(queue.clone(), WorkerConfig::test(), metrics.clone());
		assert_eq!(supervisor.reclaim_stale_jobs().await.unwrap(), 1);
		supervisor.update_metrics().await.unwrap();

		assert_eq!(queue.get_status(&stale.id).await.unwrap().unwrap().status, JobStatus::Failed);
		assert_eq!(queue.get_status(&fresh.id).await.unwrap().unwrap().status, JobStatus::Processing);
		assert_eq!(metrics.stale_reclaimed.get(), 1);
		assert_eq!(metrics.queue_length.with_label_values(&["7"]).get(), 1);
	}
}
