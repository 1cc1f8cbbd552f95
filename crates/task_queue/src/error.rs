use std::num::TryFromIntError;
use std::path::PathBuf;
use std::time::{Duration, SystemTimeError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskQueueError {
	#[error("Job execution failed: {0}")]
	ExecutionError(String),
	#[error("Job timed out after {0:?}")]
	TimeoutError(Duration),
	#[error("Job panicked: {0}")]
	Panicked(String),
	#[error("Input file does not exist: {0}")]
	InputMissing(PathBuf),
	#[error("Queue is full ({0} pending jobs)")]
	QueueFull(usize),
	#[error("Priority {0} is outside 1..=10")]
	InvalidPriority(u8),
	#[error("No tool registered for job type {0}")]
	NoToolRegistered(String),
	#[error("Job {0} not found")]
	NotFound(String),
	#[error("Job {job_id} failed: {reason}")]
	JobFailed { job_id: String, reason: String },
	#[error("Timed out waiting for job {0}")]
	WaitTimeout(String),
	#[error("Queue error: {0}")]
	QueueError(String),
	#[error("Internal error: {0}")]
	InternalError(String),
	#[error("Redis error: {0}")]
	RedisError(#[from] redis::RedisError),
	#[error("Prometheus error: {0}")]
	PrometheusError(#[from] prometheus::Error),
	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),
	#[error("I/O error: {0}")]
	IoError(#[from] std::io::Error),
	#[error("Conversion error: {0}")]
	ConversionError(String),
}

impl TaskQueueError {
	/// Failures that happen before any work is attempted and should be surfaced as-is.
	#[must_use]
	pub const fn is_capacity(&self) -> bool {
		matches!(self, Self::InputMissing(_) | Self::NoToolRegistered(_) | Self::InvalidPriority(_))
	}
}

impl From<SystemTimeError> for TaskQueueError {
	fn from(error: SystemTimeError) -> Self {
		Self::InternalError(format!("System time error: {error}"))
	}
}

impl From<TryFromIntError> for TaskQueueError {
	fn from(error: TryFromIntError) -> Self {
		Self::ConversionError(format!("Conversion error: {error}"))
	}
}
