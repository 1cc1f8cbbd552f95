use crate::config::WorkerConfig;
use crate::error::TaskQueueError;
use crate::job::{Job, JobStatus, StatusRecord, MAX_PRIORITY, MIN_PRIORITY};
use crate::queue::JobQueue;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::debug;

/// Floor for the BLPOP timeout; Redis reads 0 as an indefinite block.
const MIN_DEQUEUE_BLOCK: Duration = Duration::from_millis(1);

/// Redis-backed broker: one list per priority, status and result strings with separate expiries,
/// and a set tracking jobs currently owned by a worker.
#[derive(Clone)]
pub struct RedisJobQueue {
	client: Client,
	key_prefix: String,
	dequeue_block: Duration,
	status_ttl: Duration,
	result_ttl: Duration,
}

impl RedisJobQueue {
	///
	/// # Errors
	/// This function returns an error if:
	/// - The Redis URL is invalid
	pub fn new(config: &WorkerConfig) -> Result<Self, TaskQueueError> {
		let client = Client::open(config.redis_url.as_str())?;

		Ok(Self {
			client,
			key_prefix: config.key_prefix.clone(),
			dequeue_block: config.dequeue_block,
			status_ttl: config.status_ttl,
			result_ttl: config.result_ttl,
		})
	}

	fn queue_key(&self, priority: u8) -> String {
		format!("{}queue:{priority}", self.key_prefix)
	}

	fn status_key(&self, job_id: &str) -> String {
		format!("{}status:{job_id}", self.key_prefix)
	}

	fn result_key(&self, job_id: &str) -> String {
		format!("{}result:{job_id}", self.key_prefix)
	}

	fn processing_key(&self) -> String {
		format!("{}processing", self.key_prefix)
	}

	// A fresh multiplexed connection per call keeps one worker's BLPOP from stalling another's commands.
	async fn connection(&self) -> Result<MultiplexedConnection, TaskQueueError> {
		Ok(self.client.get_multiplexed_async_connection().await?)
	}

	async fn write_status(&self, conn: &mut MultiplexedConnection, job_id: &str, record: &StatusRecord) -> Result<(), TaskQueueError> {
		let serialized = serde_json::to_string(record)?;
		let _: () = conn.set_ex(self.status_key(job_id), serialized, self.status_ttl.as_secs().max(1)).await?;

		let processing_key = self.processing_key();
		if record.status == JobStatus::Processing {
			let _: usize = conn.sadd(&processing_key, job_id).await?;
		} else {
			let _: usize = conn.srem(&processing_key, job_id).await?;
		}
		Ok(())
	}
}

#[async_trait]
impl JobQueue for RedisJobQueue {
	///
	/// # Errors
	/// This function returns an error if:
	/// - Redis operations fails
	/// - Serialization fails
	async fn enqueue(&self, job: &Job) -> Result<(), TaskQueueError> {
		let serialized = serde_json::to_string(job)?;
		let mut conn = self.connection().await?;

		// Status first so a fast consumer never observes a job without one.
		self.write_status(&mut conn, &job.id, &StatusRecord::queued(job)).await?;
		let _: usize = conn.rpush(self.queue_key(job.priority), serialized).await?;

		debug!(job_id = %job.id, priority = job.priority, "Job enqueued");
		Ok(())
	}

	///
	/// # Errors
	/// This function returns an error if:
	/// - Redis operations fails
	/// - Deserialization fails
	async fn dequeue(&self) -> Result<Option<Job>, TaskQueueError> {
		let mut conn = self.connection().await?;
		let block_secs = self.dequeue_block.max(MIN_DEQUEUE_BLOCK).as_secs_f64();

		for priority in (MIN_PRIORITY..=MAX_PRIORITY).rev() {
			let popped: Option<(String, String)> = conn.blpop(self.queue_key(priority), block_secs).await?;
			if let Some((_, serialized)) = popped {
				return Ok(Some(serde_json::from_str(&serialized)?));
			}
		}

		Ok(None)
	}

	async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>, TaskQueueError> {
		let mut conn = self.connection().await?;
		let serialized: Option<String> = conn.get(self.status_key(job_id)).await?;
		serialized.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
	}

	async fn update_status(&self, job_id: &str, record: &StatusRecord) -> Result<(), TaskQueueError> {
		let mut conn = self.connection().await?;
		self.write_status(&mut conn, job_id, record).await
	}

	async fn store_result(&self, job_id: &str, result_path: &str) -> Result<(), TaskQueueError> {
		let mut conn = self.connection().await?;
		let _: () = conn.set_ex(self.result_key(job_id), result_path, self.result_ttl.as_secs().max(1)).await?;
		Ok(())
	}

	async fn get_result(&self, job_id: &str) -> Result<Option<String>, TaskQueueError> {
		let mut conn = self.connection().await?;
		Ok(conn.get(self.result_key(job_id)).await?)
	}

	///
	/// # Errors
	/// This function returns an error if:
	/// - Redis operations fails
	async fn queue_lengths(&self) -> Result<Vec<(u8, usize)>, TaskQueueError> {
		let mut conn = self.connection().await?;
		let mut lengths = Vec::with_capacity(usize::from(MAX_PRIORITY));

		for priority in (MIN_PRIORITY..=MAX_PRIORITY).rev() {
			let len: usize = conn.llen(self.queue_key(priority)).await?;
			lengths.push((priority, len));
		}

		Ok(lengths)
	}

	async fn processing_jobs(&self) -> Result<Vec<String>, TaskQueueError> {
		let mut conn = self.connection().await?;
		Ok(conn.smembers(self.processing_key()).await?)
	}
}
