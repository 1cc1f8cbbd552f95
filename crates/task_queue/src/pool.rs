use crate::config::WorkerConfig;
use crate::error::TaskQueueError;
use crate::job::JobType;
use crate::queue::JobQueue;
use crate::supervisor::Supervisor;
use crate::worker::{HeavySlots, HeavyTool, HeavyToolGauge, JobOutcome, JobReport, ToolRegistry, Worker, WorkerContext};
use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct PoolMetrics {
	pub active_workers: IntGauge,
	pub queue_length: IntGaugeVec,
	pub jobs_processed: IntCounter,
	pub jobs_failed: IntCounter,
	pub heavy_in_flight: IntGauge,
	pub stale_reclaimed: IntCounter,
}

impl PoolMetrics {
	///
	/// # Errors
	/// Returns an error if a collector with the same name is already registered
	pub fn register(registry: &Registry) -> Result<Self, TaskQueueError> {
		let active_workers = IntGauge::new("worker_pool_active_workers", "Number of active workers")?;
		let queue_length = IntGaugeVec::new(Opts::new("worker_pool_queue_length", "Pending jobs per priority"), &["priority"])?;
		let jobs_processed = IntCounter::new("worker_pool_jobs_processed", "Total jobs processed")?;
		let jobs_failed = IntCounter::new("worker_pool_job_errors", "Total failed jobs")?;
		let heavy_in_flight = IntGauge::new("worker_pool_heavy_tools_in_flight", "Heavy tool invocations currently running")?;
		let stale_reclaimed = IntCounter::new("worker_pool_stale_reclaimed", "Processing jobs reclaimed after max_duration")?;

		registry.register(Box::new(active_workers.clone()))?;
		registry.register(Box::new(queue_length.clone()))?;
		registry.register(Box::new(jobs_processed.clone()))?;
		registry.register(Box::new(jobs_failed.clone()))?;
		registry.register(Box::new(heavy_in_flight.clone()))?;
		registry.register(Box::new(stale_reclaimed.clone()))?;

		Ok(Self {
			active_workers,
			queue_length,
			jobs_processed,
			jobs_failed,
			heavy_in_flight,
			stale_reclaimed,
		})
	}
}

/// Fixed set of workers sharing one queue and one heavy-tool semaphore.
///
/// Two limits apply at once: the worker count bounds how many jobs are owned at a time,
/// `heavy_slots` bounds how many of them may be inside a heavy subprocess.
pub struct WorkerPool {
	config: WorkerConfig,
	queue: Arc<dyn JobQueue>,
	tools: ToolRegistry,
	metrics: PoolMetrics,
	heavy: HeavySlots,
}

impl WorkerPool {
	///
	/// # Errors
	/// Returns an error if the pool metrics cannot be registered
	pub fn new(queue: Arc<dyn JobQueue>, config: WorkerConfig, registry: &Registry) -> Result<Self, TaskQueueError> {
		let metrics = PoolMetrics::register(registry)?;
		let heavy = HeavySlots::new(config.heavy_slots, HeavyToolGauge::new(Some(metrics.heavy_in_flight.clone())));

		Ok(Self {
			config,
			queue,
			tools: HashMap::new(),
			metrics,
			heavy,
		})
	}

	#[must_use]
	pub fn with_tool(mut self, job_type: JobType, tool: Arc<dyn HeavyTool>) -> Self {
		self.tools.insert(job_type, tool);
		self
	}

	/// Replaces the pool's own heavy slots with a cap shared with other callers.
	#[must_use]
	pub fn with_heavy_slots(mut self, heavy: HeavySlots) -> Self {
		self.heavy = heavy;
		self
	}

	#[must_use]
	pub fn heavy_slots(&self) -> HeavySlots {
		self.heavy.clone()
	}

	#[must_use]
	pub const fn gauge(&self) -> &HeavyToolGauge {
		self.heavy.gauge()
	}

	/// Runs workers and the supervisor until `cancel` fires.
	///
	/// # Errors
	/// Returns an error if a worker exits abnormally
	pub async fn start(&self, cancel: CancellationToken) -> Result<(), TaskQueueError> {
		let num_workers = self.config.resolved_workers();
		let (tx, mut rx) = mpsc::channel(100);

		let ctx = WorkerContext {
			queue: Arc::clone(&self.queue),
			tools: Arc::new(self.tools.clone()),
			heavy: self.heavy.clone(),
			idle_delay: self.config.idle_delay,
		};

		info!(workers = num_workers, heavy_slots = self.config.heavy_slots, "Starting worker pool");

		let mut workers = JoinSet::new();
		for id in 0..num_workers {
			let worker_tx = tx.clone();
			let worker = Worker::new(id, ctx.clone());
			let cancel = cancel.child_token();
			workers.spawn(async move { worker.run(worker_tx, cancel).await });
			self.metrics.active_workers.inc();
		}
		drop(tx);

		let supervisor = Supervisor::new(Arc::clone(&self.queue), self.config.clone(), self.metrics.clone());
		let supervisor_cancel = cancel.child_token();
		let supervisor_handle = tokio::spawn(async move { supervisor.run(supervisor_cancel).await });

		// Result handler; ends once every worker has dropped its sender.
		while let Some(report) = rx.recv().await {
			self.handle_report(&report);
		}

		let mut first_error = None;
		while let Some(joined) = workers.join_next().await {
			self.metrics.active_workers.dec();
			match joined {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					error!(error = %e, "Worker exited with error");
					first_error.get_or_insert(e);
				}
				Err(e) => {
					error!(error = %e, "Worker task aborted");
					first_error.get_or_insert(TaskQueueError::InternalError(e.to_string()));
				}
			}
		}

		cancel.cancel();
		if let Err(e) = supervisor_handle.await {
			error!(error = %e, "Supervisor task aborted");
		}

		first_error.map_or(Ok(()), Err)
	}

	fn handle_report(&self, report: &JobReport) {
		self.metrics.jobs_processed.inc();

		match &report.outcome {
			JobOutcome::Completed { result_path } => {
				debug!(job_id = %report.job_id, worker_id = report.worker_id, elapsed_ms = report.elapsed.as_millis(), result_path, "Job completed");
			}
			JobOutcome::Failed { error } => {
				self.metrics.jobs_failed.inc();
				debug!(job_id = %report.job_id, worker_id = report.worker_id, elapsed_ms = report.elapsed.as_millis(), error, "Job failed");
			}
		}
	}
}
