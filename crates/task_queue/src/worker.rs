use crate::error::TaskQueueError;
use crate::job::{Job, JobType, StatusRecord};
use crate::queue::JobQueue;
use async_trait::async_trait;
use prometheus::IntGauge;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// An external, CPU/GPU-heavy program driven by a worker.
///
/// `run` is the expensive part and executes while a heavy slot is held. `finalize` converts
/// the raw output into the stored result after the slot has been released.
#[async_trait]
pub trait HeavyTool: Send + Sync {
	fn name(&self) -> &str;

	async fn run(&self, job: &Job) -> Result<PathBuf, TaskQueueError>;

	async fn finalize(&self, _job: &Job, raw_output: PathBuf) -> Result<PathBuf, TaskQueueError> {
		Ok(raw_output)
	}
}

pub type ToolRegistry = HashMap<JobType, Arc<dyn HeavyTool>>;

/// Counts heavy invocations in flight and remembers the high-water mark.
#[derive(Clone)]
pub struct HeavyToolGauge {
	current: Arc<AtomicUsize>,
	peak: Arc<AtomicUsize>,
	exported: Option<IntGauge>,
}

impl HeavyToolGauge {
	#[must_use]
	pub fn new(exported: Option<IntGauge>) -> Self {
		Self {
			current: Arc::new(AtomicUsize::new(0)),
			peak: Arc::new(AtomicUsize::new(0)),
			exported,
		}
	}

	#[must_use]
	pub fn enter(&self) -> HeavyToolGuard {
		let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
		self.peak.fetch_max(now, Ordering::SeqCst);
		if let Some(gauge) = &self.exported {
			gauge.inc();
		}
		HeavyToolGuard { gauge: self.clone() }
	}

	#[must_use]
	pub fn current(&self) -> usize {
		self.current.load(Ordering::SeqCst)
	}

	#[must_use]
	pub fn peak(&self) -> usize {
		self.peak.load(Ordering::SeqCst)
	}
}

pub struct HeavyToolGuard {
	gauge: HeavyToolGauge,
}

impl Drop for HeavyToolGuard {
	fn drop(&mut self) {
		self.gauge.current.fetch_sub(1, Ordering::SeqCst);
		if let Some(gauge) = &self.gauge.exported {
			gauge.dec();
		}
	}
}

/// The global cap on heavy subprocesses. Clones share one semaphore and one gauge, so queue
/// workers and in-process callers draw from the same slots.
#[derive(Clone)]
pub struct HeavySlots {
	semaphore: Arc<Semaphore>,
	gauge: HeavyToolGauge,
}

impl HeavySlots {
	#[must_use]
	pub fn new(slots: usize, gauge: HeavyToolGauge) -> Self {
		Self {
			semaphore: Arc::new(Semaphore::new(slots)),
			gauge,
		}
	}

	/// Waits for a free slot. The slot is held until the returned permit drops.
	///
	/// # Errors
	/// Returns an error if the semaphore was closed
	pub async fn acquire(&self) -> Result<HeavyPermit, TaskQueueError> {
		let permit = Arc::clone(&self.semaphore)
			.acquire_owned()
			.await
			.map_err(|_| TaskQueueError::InternalError("heavy tool semaphore closed".to_string()))?;
		Ok(HeavyPermit {
			_in_flight: self.gauge.enter(),
			_permit: permit,
		})
	}

	#[must_use]
	pub fn available(&self) -> usize {
		self.semaphore.available_permits()
	}

	#[must_use]
	pub const fn gauge(&self) -> &HeavyToolGauge {
		&self.gauge
	}
}

pub struct HeavyPermit {
	_in_flight: HeavyToolGuard,
	_permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
	Completed { result_path: String },
	Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct JobReport {
	pub job_id: String,
	pub worker_id: usize,
	pub outcome: JobOutcome,
	pub elapsed: Duration,
}

/// State shared by every worker of a pool.
#[derive(Clone)]
pub struct WorkerContext {
	pub queue: Arc<dyn JobQueue>,
	pub tools: Arc<ToolRegistry>,
	pub heavy: HeavySlots,
	pub idle_delay: Duration,
}

pub struct Worker {
	id: usize,
	ctx: WorkerContext,
}

impl Worker {
	#[must_use]
	pub const fn new(id: usize, ctx: WorkerContext) -> Self {
		Self { id, ctx }
	}

	/// Dequeue-and-process loop. Exits when `cancel` fires or the report channel closes.
	///
	/// # Errors
	/// Returns an error if the report channel is closed
	pub async fn run(&self, report_tx: mpsc::Sender<JobReport>, cancel: CancellationToken) -> Result<(), TaskQueueError> {
		info!(worker_id = self.id, "Worker started");

		loop {
			let next = tokio::select! {
				() = cancel.cancelled() => break,
				next = self.ctx.queue.dequeue() => next,
			};

			let job = match next {
				Ok(Some(job)) => job,
				Ok(None) => {
					// Small delay to prevent tight polling
					sleep(self.ctx.idle_delay).await;
					continue;
				}
				Err(e) => {
					error!(worker_id = self.id, error = %e, "Dequeue failed");
					sleep(self.ctx.idle_delay).await;
					continue;
				}
			};

			let report = self.handle(job).await;
			if report_tx.send(report).await.is_err() {
				return Err(TaskQueueError::InternalError("Result channel closed".to_string()));
			}
		}

		info!(worker_id = self.id, "Worker stopped");
		Ok(())
	}

	/// Owns one job from `processing` to a terminal status.
	pub async fn handle(&self, job: Job) -> JobReport {
		let start = Instant::now();
		let job_id = job.id.clone();
		let processing = StatusRecord::processing(&job);

		if let Err(e) = self.ctx.queue.update_status(&job_id, &processing).await {
			warn!(job_id = %job_id, error = %e, "Failed to mark job processing");
		}
		info!(worker_id = self.id, job = %job, "Processing job");

		// The spawned task is the fault boundary: a panic inside a tool becomes a JoinError here.
		let ctx = self.ctx.clone();
		let execution = tokio::spawn(async move { execute(&ctx, &job).await });

		let outcome = match execution.await {
			Ok(Ok(path)) => {
				let result_path = path.to_string_lossy().into_owned();
				match self.ctx.queue.store_result(&job_id, &result_path).await {
					Ok(()) => JobOutcome::Completed { result_path },
					Err(e) => JobOutcome::Failed {
						error: format!("failed to store result: {e}"),
					},
				}
			}
			Ok(Err(e)) => JobOutcome::Failed { error: e.to_string() },
			Err(join_err) if join_err.is_panic() => JobOutcome::Failed {
				error: TaskQueueError::Panicked(panic_message(join_err.into_panic())).to_string(),
			},
			Err(join_err) => JobOutcome::Failed { error: join_err.to_string() },
		};

		let terminal = match &outcome {
			JobOutcome::Completed { .. } => processing.completed(),
			JobOutcome::Failed { error } => {
				error!(worker_id = self.id, job_id = %job_id, error = %error, "Job failed");
				processing.failed(error.clone())
			}
		};

		if let Err(e) = self.ctx.queue.update_status(&job_id, &terminal).await {
			error!(job_id = %job_id, error = %e, "Failed to record terminal status");
		}

		JobReport {
			job_id,
			worker_id: self.id,
			outcome,
			elapsed: start.elapsed(),
		}
	}
}

async fn execute(ctx: &WorkerContext, job: &Job) -> Result<PathBuf, TaskQueueError> {
	if !tokio::fs::try_exists(&job.payload.input_path).await.unwrap_or(false) {
		return Err(TaskQueueError::InputMissing(job.payload.input_path.clone()));
	}

	let tool = ctx.tools.get(&job.job_type).cloned().ok_or_else(|| TaskQueueError::NoToolRegistered(job.job_type.to_string()))?;

	let raw_output = {
		let _slot = ctx.heavy.acquire().await?;

		let budget = job.max_duration();
		match timeout(budget, tool.run(job)).await {
			Ok(result) => result?,
			Err(_) => {
				warn!(job_id = %job.id, tool = tool.name(), ?budget, "Heavy tool exceeded max_duration");
				return Err(TaskQueueError::TimeoutError(budget));
			}
		}
	};

	tool.finalize(job, raw_output).await
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
	payload
		.downcast_ref::<&str>()
		.map(|s| (*s).to_string())
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::job::{JobPayload, JobStatus};
	use crate::queue::InMemoryJobQueue;
	use tempfile::TempDir;

	enum Behaviour {
		Succeed,
		Hang,
		Fail,
		Panic,
	}

	struct FakeTool {
		behaviour: Behaviour,
		output_dir: PathBuf,
	}

	#[async_trait]
	impl HeavyTool for FakeTool {
		fn name(&self) -> &str {
			"fake"
		}

		async fn run(&self, job: &Job) -> Result<PathBuf, TaskQueueError> {
			match self.behaviour {
				Behaviour::Succeed => Ok(self.output_dir.join(format!("{}.raw", job.id))),
				Behaviour::Hang => {
					sleep(Duration::from_secs(30)).await;
					Ok(self.output_dir.join("never"))
				}
				Behaviour::Fail => Err(TaskQueueError::ExecutionError("exit status 1".to_string())),
				Behaviour::Panic => panic!("tool blew up"),
			}
		}

		async fn finalize(&self, _job: &Job, raw_output: PathBuf) -> Result<PathBuf, TaskQueueError> {
			Ok(raw_output.with_extension("wav"))
		}
	}

	fn setup(behaviour: Behaviour) -> (TempDir, Arc<InMemoryJobQueue>, Worker) {
		let dir = TempDir::new().unwrap();
		let queue = Arc::new(InMemoryJobQueue::default());
		let mut tools: ToolRegistry = HashMap::new();
		tools.insert(
			JobType::SourceSeparation,
			Arc::new(FakeTool {
				behaviour,
				output_dir: dir.path().to_path_buf(),
			}),
		);
		let ctx = WorkerContext {
			queue: queue.clone(),
			tools: Arc::new(tools),
			heavy: HeavySlots::new(1, HeavyToolGauge::new(None)),
			idle_delay: Duration::from_millis(5),
		};
		(dir, queue, Worker::new(0, ctx))
	}

	fn job_for(dir: &TempDir, max_duration: Duration) -> Job {
		let input = dir.path().join("input.wav");
		std::fs::write(&input, b"RIFF").unwrap();
		Job::new(JobType::SourceSeparation, 5, JobPayload::new(input, dir.path()), max_duration).unwrap()
	}

	#[tokio::test]
	async fn test_successful_job_stores_result() {
		let (dir, queue, worker) = setup(Behaviour::Succeed);
		let job = job_for(&dir, Duration::from_secs(5));
		queue.enqueue(&job).await.unwrap();

		let report = worker.handle(job.clone()).await;

		assert!(matches!(report.outcome, JobOutcome::Completed { .. }));
		assert_eq!(queue.get_status(&job.id).await.unwrap().unwrap().status, JobStatus::Completed);
		let stored = queue.get_result(&job.id).await.unwrap().unwrap();
		assert!(stored.ends_with(".wav"));
	}

	#[tokio::test]
	async fn test_timeout_fails_job_and_releases_slot() {
		let (dir, queue, worker) = setup(Behaviour::Hang);
		let job = job_for(&dir, Duration::from_secs(1));
		queue.enqueue(&job).await.unwrap();

		let report = worker.handle(job.clone()).await;

		assert!(matches!(report.outcome, JobOutcome::Failed { ref error } if error.contains("timed out")));
		assert_eq!(queue.get_status(&job.id).await.unwrap().unwrap().status, JobStatus::Failed);
		assert!(queue.get_result(&job.id).await.unwrap().is_none());
		assert_eq!(worker.ctx.heavy.available(), 1);
		assert_eq!(worker.ctx.heavy.gauge().current(), 0);
	}

	#[tokio::test]
	async fn test_panic_is_recovered_as_failure() {
		let (dir, queue, worker) = setup(Behaviour::Panic);
		let job = job_for(&dir, Duration::from_secs(5));

		let report = worker.handle(job.clone()).await;

		match report.outcome {
			JobOutcome::Failed { error } => assert!(error.contains("tool blew up")),
			JobOutcome::Completed { .. } => panic!("expected failure"),
		}
		assert_eq!(queue.get_status(&job.id).await.unwrap().unwrap().status, JobStatus::Failed);
		assert_eq!(worker.ctx.heavy.available(), 1);
	}

	#[tokio::test]
	async fn test_tool_error_is_recorded() {
		let (dir, queue, worker) = setup(Behaviour::Fail);
		let job = job_for(&dir, Duration::from_secs(5));

		worker.handle(job.clone()).await;

		let record = queue.get_status(&job.id).await.unwrap().unwrap();
		assert_eq!(record.status, JobStatus::Failed);
		assert!(record.error.unwrap().contains("exit status 1"));
	}

	#[tokio::test]
	async fn test_missing_input_fails_without_taking_a_slot() {
		let (dir, queue, worker) = setup(Behaviour::Succeed);
		let job = Job::new(JobType::SourceSeparation, 5, JobPayload::new(dir.path().join("absent.wav"), dir.path()), Duration::from_secs(5)).unwrap();

		let report = worker.handle(job.clone()).await;

		assert!(matches!(report.outcome, JobOutcome::Failed { ref error } if error.contains("does not exist")));
		assert_eq!(worker.ctx.heavy.gauge().peak(), 0);
		assert_eq!(queue.get_status(&job.id).await.unwrap().unwrap().status, JobStatus::Failed);
	}

	#[tokio::test]
	async fn test_unregistered_job_type_fails() {
		let (dir, queue, worker) = setup(Behaviour::Succeed);
		let input = dir.path().join("input.wav");
		std::fs::write(&input, b"RIFF").unwrap();
		let job = Job::new(JobType::AudioConvert, 5, JobPayload::new(input, dir.path()), Duration::from_secs(5)).unwrap();

		worker.handle(job.clone()).await;

		let record = queue.get_status(&job.id).await.unwrap().unwrap();
		assert!(record.error.unwrap().contains("audio_convert"));
	}

	#[test]
	fn test_gauge_tracks_peak() {
		let gauge = HeavyToolGauge::new(None);
		{
			let _a = gauge.enter();
			let _b = gauge.enter();
			assert_eq!(gauge.current(), 2);
		}
		assert_eq!(gauge.current(), 0);
		assert_eq!(gauge.peak(), 2);
	}
}
