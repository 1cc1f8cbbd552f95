use crate::error::TaskQueueError;
use crate::job::{Job, JobStatus, StatusRecord, MAX_PRIORITY, MIN_PRIORITY};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// Broker contract shared by the Redis queue and the in-process queue.
///
/// Dequeue honours priority across levels (10 first, 1 last) and FIFO within a level.
/// There is no aging: a steady stream of high-priority work starves the lower levels.
#[async_trait]
pub trait JobQueue: Send + Sync {
	/// Appends the job to its priority list and records it as `queued`.
	async fn enqueue(&self, job: &Job) -> Result<(), TaskQueueError>;

	/// Pops the head of the highest non-empty priority list, blocking briefly per level.
	async fn dequeue(&self) -> Result<Option<Job>, TaskQueueError>;

	async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>, TaskQueueError>;

	async fn update_status(&self, job_id: &str, record: &StatusRecord) -> Result<(), TaskQueueError>;

	async fn store_result(&self, job_id: &str, result_path: &str) -> Result<(), TaskQueueError>;

	async fn get_result(&self, job_id: &str) -> Result<Option<String>, TaskQueueError>;

	/// Pending jobs per priority, highest priority first.
	async fn queue_lengths(&self) -> Result<Vec<(u8, usize)>, TaskQueueError>;

	/// Ids of jobs whose last recorded status is `processing`.
	async fn processing_jobs(&self) -> Result<Vec<String>, TaskQueueError>;
}

/// Looks up a job status, reclaiming a stale `processing` record as `failed`.
///
/// # Errors
/// Propagates broker failures
pub async fn resolve_status(queue: &dyn JobQueue, job_id: &str, grace: Duration) -> Result<JobStatus, TaskQueueError> {
	let Some(record) = queue.get_status(job_id).await? else {
		return Ok(JobStatus::NotFound);
	};

	if record.is_stale(Utc::now(), grace) {
		reclaim(queue, job_id, record).await?;
		return Ok(JobStatus::Failed);
	}

	Ok(record.status)
}

/// Marks a stale record as failed. Returns whether anything was reclaimed.
///
/// # Errors
/// Propagates broker failures
pub async fn reclaim_if_stale(queue: &dyn JobQueue, job_id: &str, grace: Duration) -> Result<bool, TaskQueueError> {
	match queue.get_status(job_id).await? {
		Some(record) if record.is_stale(Utc::now(), grace) => {
			reclaim(queue, job_id, record).await?;
			Ok(true)
		}
		_ => Ok(false),
	}
}

async fn reclaim(queue: &dyn JobQueue, job_id: &str, record: StatusRecord) -> Result<(), TaskQueueError> {
	let budget = record.max_duration_secs;
	warn!(job_id, max_duration_secs = budget, "Reclaiming stale processing job");
	let failed = record.failed(format!("no completion within max_duration ({budget}s)"));
	queue.update_status(job_id, &failed).await
}

struct Expiring<T> {
	value: T,
	expires_at: Instant,
}

impl<T> Expiring<T> {
	fn new(value: T, ttl: Duration) -> Self {
		Self {
			value,
			expires_at: Instant::now() + ttl,
		}
	}

	fn live(&self) -> Option<&T> {
		(Instant::now() < self.expires_at).then_some(&self.value)
	}

	fn is_expired(&self, now: Instant) -> bool {
		now >= self.expires_at
	}
}

#[derive(Default)]
struct InMemoryState {
	levels: HashMap<u8, VecDeque<Job>>,
	statuses: HashMap<String, Expiring<StatusRecord>>,
	results: HashMap<String, Expiring<String>>,
}

impl InMemoryState {
	/// Drops expired status and result records so the maps track only live jobs.
	fn prune_expired(&mut self) {
		let now = Instant::now();
		self.statuses.retain(|_, entry| !entry.is_expired(now));
		self.results.retain(|_, entry| !entry.is_expired(now));
	}
}

/// Process-local broker with the same semantics as [`crate::redis_queue::RedisJobQueue`].
pub struct InMemoryJobQueue {
	state: Mutex<InMemoryState>,
	notify: Notify,
	block: Duration,
	status_ttl: Duration,
	result_ttl: Duration,
	capacity: Option<usize>,
}

impl InMemoryJobQueue {
	#[must_use]
	pub fn new(block: Duration, status_ttl: Duration, result_ttl: Duration) -> Self {
		Self {
			state: Mutex::new(InMemoryState::default()),
			notify: Notify::new(),
			block,
			status_ttl,
			result_ttl,
			capacity: None,
		}
	}

	/// Caps pending jobs across all levels; `enqueue` beyond it fails with `QueueFull`.
	#[must_use]
	pub fn with_capacity(mut self, capacity: usize) -> Self {
		self.capacity = Some(capacity);
		self
	}

	fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, TaskQueueError> {
		self.state.lock().map_err(|e| TaskQueueError::InternalError(format!("queue state poisoned: {e}")))
	}

	fn pop_highest(&self) -> Result<Option<Job>, TaskQueueError> {
		let mut state = self.lock()?;
		for priority in (MIN_PRIORITY..=MAX_PRIORITY).rev() {
			if let Some(job) = state.levels.get_mut(&priority).and_then(VecDeque::pop_front) {
				return Ok(Some(job));
			}
		}
		Ok(None)
	}
}

impl Default for InMemoryJobQueue {
	fn default() -> Self {
		Self::new(Duration::from_millis(50), Duration::from_secs(86_400), Duration::from_secs(604_800))
	}
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
	async fn enqueue(&self, job: &Job) -> Result<(), TaskQueueError> {
		{
			let mut state = self.lock()?;
			if let Some(capacity) = self.capacity {
				let pending: usize = state.levels.values().map(VecDeque::len).sum();
				if pending >= capacity {
					return Err(TaskQueueError::QueueFull(pending));
				}
			}
			state.prune_expired();
			state.levels.entry(job.priority).or_default().push_back(job.clone());
			state.statuses.insert(job.id.clone(), Expiring::new(StatusRecord::queued(job), self.status_ttl));
		}
		self.notify.notify_one();
		Ok(())
	}

	async fn dequeue(&self) -> Result<Option<Job>, TaskQueueError> {
		if let Some(job) = self.pop_highest()? {
			return Ok(Some(job));
		}

		// Nothing pending: wait once for a producer, then give up.
		let _ = tokio::time::timeout(self.block, self.notify.notified()).await;
		self.pop_highest()
	}

	async fn get_status(&self, job_id: &str) -> Result<Option<StatusRecord>, TaskQueueError> {
		let state = self.lock()?;
		Ok(state.statuses.get(job_id).and_then(Expiring::live).cloned())
	}

	async fn update_status(&self, job_id: &str, record: &StatusRecord) -> Result<(), TaskQueueError> {
		let mut state = self.lock()?;
		state.prune_expired();
		state.statuses.insert(job_id.to_string(), Expiring::new(record.clone(), self.status_ttl));
		Ok(())
	}

	async fn store_result(&self, job_id: &str, result_path: &str) -> Result<(), TaskQueueError> {
		let mut state = self.lock()?;
		state.prune_expired();
		state.results.insert(job_id.to_string(), Expiring::new(result_path.to_string(), self.result_ttl));
		Ok(())
	}

	async fn get_result(&self, job_id: &str) -> Result<Option<String>, TaskQueueError> {
		let state = self.lock()?;
		Ok(state.results.get(job_id).and_then(Expiring::live).cloned())
	}

	async fn queue_lengths(&self) -> Result<Vec<(u8, usize)>, TaskQueueError> {
		let state = self.lock()?;
		Ok((MIN_PRIORITY..=MAX_PRIORITY).rev().map(|p| (p, state.levels.get(&p).map_or(0, VecDeque::len))).collect())
	}

	async fn processing_jobs(&self) -> Result<Vec<String>, TaskQueueError> {
		let state = self.lock()?;
		Ok(
			state
				.statuses
				.iter()
				.filter(|(_, entry)| entry.live().is_some_and(|record| record.status == JobStatus::Processing))
				.map(|(id, _)| id.clone())
				.collect(),
		)
	}
}
