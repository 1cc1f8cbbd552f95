use crate::error::TaskQueueError;
use crate::job::{Job, JobPayload, JobStatus, JobType};
use crate::queue::{resolve_status, JobQueue};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::info;

/// Producer-side handle: submit work, look it up, wait for it.
#[derive(Clone)]
pub struct JobClient {
	queue: Arc<dyn JobQueue>,
	poll_interval: Duration,
	stale_grace: Duration,
}

impl JobClient {
	#[must_use]
	pub fn new(queue: Arc<dyn JobQueue>, poll_interval: Duration, stale_grace: Duration) -> Self {
		Self { queue, poll_interval, stale_grace }
	}

	///
	/// # Errors
	/// Returns error if the priority is invalid or the broker rejects the job
	pub async fn submit(&self, job_type: JobType, priority: u8, payload: JobPayload, max_duration: Duration) -> Result<String, TaskQueueError> {
		let job = Job::new(job_type, priority, payload, max_duration)?;
		self.queue.enqueue(&job).await?;
		info!(job_id = %job.id, %job_type, priority, "Job submitted");
		Ok(job.id)
	}

	///
	/// # Errors
	/// Propagates broker failures
	pub async fn status(&self, job_id: &str) -> Result<JobStatus, TaskQueueError> {
		resolve_status(self.queue.as_ref(), job_id, self.stale_grace).await
	}

	/// Result path of a completed job; `None` for any other status.
	///
	/// # Errors
	/// Propagates broker failures
	pub async fn result(&self, job_id: &str) -> Result<Option<String>, TaskQueueError> {
		if self.status(job_id).await? != JobStatus::Completed {
			return Ok(None);
		}
		self.queue.get_result(job_id).await
	}

	/// Failure reason recorded for the job, if any.
	///
	/// # Errors
	/// Propagates broker failures
	pub async fn failure_reason(&self, job_id: &str) -> Result<Option<String>, TaskQueueError> {
		Ok(self.queue.get_status(job_id).await?.and_then(|record| record.error))
	}

	/// Polls the status at a fixed interval until the job reaches a terminal state.
	///
	/// # Errors
	/// - `WaitTimeout` if `timeout` elapses first
	/// - `JobFailed` if the job failed
	/// - `NotFound` if the job is unknown or its status expired
	pub async fn wait(&self, job_id: &str, timeout: Duration) -> Result<String, TaskQueueError> {
		let deadline = Instant::now() + timeout;

		loop {
			match self.status(job_id).await? {
				JobStatus::Completed => {
					return self
						.queue
						.get_result(job_id)
						.await?
						.ok_or_else(|| TaskQueueError::QueueError(format!("job {job_id} completed without a stored result")));
				}
				JobStatus::Failed => {
					let reason = self.failure_reason(job_id).await?.unwrap_or_else(|| "unknown".to_string());
					return Err(TaskQueueError::JobFailed {
						job_id: job_id.to_string(),
						reason,
					});
				}
				JobStatus::NotFound => return Err(TaskQueueError::NotFound(job_id.to_string())),
				JobStatus::Queued | JobStatus::Processing => {}
			}

			if Instant::now() + self.poll_interval > deadline {
				return Err(TaskQueueError::WaitTimeout(job_id.to_string()));
			}
			sleep(self.poll_interval).await;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::StatusRecord;
	use crate::queue::InMemoryJobQueue;

	fn client(queue: Arc<InMemoryJobQueue>) -> JobClient {
		JobClient::new(queue, Duration::from_millis(10), Duration::ZERO)
	}

	#[tokio::test]
	async fn test_status_lifecycle_never_skips_queued() {
		let queue = Arc::new(InMemoryJobQueue::default());
		let client = client(queue.clone());

		let id = client.submit(JobType::SourceSeparation, 5, JobPayload::new("in.wav", "out"), Duration::from_secs(60)).await.unwrap();
		assert_eq!(client.status(&id).await.unwrap(), JobStatus::Queued);
		assert!(client.result(&id).await.unwrap().is_none());

		let job = queue.dequeue().await.unwrap().unwrap();
		let processing = StatusRecord::processing(&job);
		queue.update_status(&id, &processing).await.unwrap();
		assert_eq!(client.status(&id).await.unwrap(), JobStatus::Processing);

		queue.store_result(&id, "/out/vocals.wav").await.unwrap();
		queue.update_status(&id, &processing.completed()).await.unwrap();
		assert_eq!(client.status(&id).await.unwrap(), JobStatus::Completed);
		assert_eq!(client.result(&id).await.unwrap().as_deref(), Some("/out/vocals.wav"));
	}

	#[tokio::test]
	async fn test_submit_rejects_bad_priority() {
		let client = client(Arc::new(InMemoryJobQueue::default()));
		let err = client.submit(JobType::AudioConvert, 42, JobPayload::new("in.wav", "out"), Duration::from_secs(60)).await.unwrap_err();
		assert!(matches!(err, TaskQueueError::InvalidPriority(42)));
		assert!(err.is_capacity());
	}

	#[tokio::test]
	async fn test_wait_times_out_while_queued() {
		let client = client(Arc::new(InMemoryJobQueue::default()));
		let id = client.submit(JobType::AudioConvert, 3, JobPayload::new("in.wav", "out"), Duration::from_secs(60)).await.unwrap();

		let err = client.wait(&id, Duration::from_millis(50)).await.unwrap_err();
		assert!(matches!(err, TaskQueueError::WaitTimeout(_)));
	}

	#[tokio::test]
	async fn test_wait_returns_result_or_failure() {
		let queue = Arc::new(InMemoryJobQueue::default());
		let client = client(queue.clone());

		let ok_id = client.submit(JobType::AudioConvert, 3, JobPayload::new("in.wav", "out"), Duration::from_secs(60)).await.unwrap();
		let bad_id = client.submit(JobType::AudioConvert, 3, JobPayload::new("in.wav", "out"), Duration::from_secs(60)).await.unwrap();

		let finisher = {
			let queue = queue.clone();
			let (ok_id, bad_id) = (ok_id.clone(), bad_id.clone());
			tokio::spawn(async move {
				sleep(Duration::from_millis(30)).await;
				let ok = queue.get_status(&ok_id).await.unwrap().unwrap();
				queue.store_result(&ok_id, "/out/a.wav").await.unwrap();
				queue.update_status(&ok_id, &ok.completed()).await.unwrap();
				let bad = queue.get_status(&bad_id).await.unwrap().unwrap();
				queue.update_status(&bad_id, &bad.failed("separator crashed")).await.unwrap();
			})
		};

		assert_eq!(client.wait(&ok_id, Duration::from_secs(2)).await.unwrap(), "/out/a.wav");
		let err = client.wait(&bad_id, Duration::from_secs(2)).await.unwrap_err();
		assert!(matches!(err, TaskQueueError::JobFailed { ref reason, .. } if reason == "separator crashed"));
		finisher.await.unwrap();

		assert!(matches!(client.wait("missing", Duration::from_secs(1)).await.unwrap_err(), TaskQueueError::NotFound(_)));
	}
}
