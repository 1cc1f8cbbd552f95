use crate::error::TaskQueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
	/// Split a mix into vocal and accompaniment stems.
	SourceSeparation,
	/// Re-encode an audio file into the canonical working format.
	AudioConvert,
}

impl fmt::Display for JobType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::SourceSeparation => write!(f, "source_separation"),
			Self::AudioConvert => write!(f, "audio_convert"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
	pub input_path: PathBuf,
	pub output_dir: PathBuf,
	#[serde(default)]
	pub params: BTreeMap<String, String>,
}

impl JobPayload {
	pub fn new(input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
		Self {
			input_path: input_path.into(),
			output_dir: output_dir.into(),
			params: BTreeMap::new(),
		}
	}

	#[must_use]
	pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.params.insert(key.into(), value.into());
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
	pub id: String,
	pub job_type: JobType,
	pub priority: u8,
	pub payload: JobPayload,
	pub max_duration_secs: u64, // Stored as seconds for broker compatibility
	pub created_at: DateTime<Utc>,
}

impl Job {
	///
	/// # Errors
	/// Returns error if the priority is outside `1..=10`
	pub fn new(job_type: JobType, priority: u8, payload: JobPayload, max_duration: Duration) -> Result<Self, TaskQueueError> {
		if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
			return Err(TaskQueueError::InvalidPriority(priority));
		}

		Ok(Self {
			id: Uuid::new_v4().to_string(),
			job_type,
			priority,
			payload,
			max_duration_secs: max_duration.as_secs().max(1),
			created_at: Utc::now(),
		})
	}

	#[must_use]
	pub const fn max_duration(&self) -> Duration {
		Duration::from_secs(self.max_duration_secs)
	}
}

impl fmt::Display for Job {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} [{}] p{} ({})", self.id, self.job_type, self.priority, self.payload.input_path.display())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	NotFound,
	Queued,
	Processing,
	Completed,
	Failed,
}

impl JobStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed)
	}
}

impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::NotFound => "not_found",
			Self::Queued => "queued",
			Self::Processing => "processing",
			Self::Completed => "completed",
			Self::Failed => "failed",
		};
		f.write_str(s)
	}
}

/// What the broker stores under a job's status key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
	pub status: JobStatus,
	pub max_duration_secs: u64,
	pub started_at: Option<DateTime<Utc>>,
	pub updated_at: DateTime<Utc>,
	pub error: Option<String>,
}

impl StatusRecord {
	#[must_use]
	pub fn queued(job: &Job) -> Self {
		Self {
			status: JobStatus::Queued,
			max_duration_secs: job.max_duration_secs,
			started_at: None,
			updated_at: Utc::now(),
			error: None,
		}
	}

	#[must_use]
	pub fn processing(job: &Job) -> Self {
		let now = Utc::now();
		Self {
			status: JobStatus::Processing,
			max_duration_secs: job.max_duration_secs,
			started_at: Some(now),
			updated_at: now,
			error: None,
		}
	}

	#[must_use]
	pub fn completed(mut self) -> Self {
		self.status = JobStatus::Completed;
		self.updated_at = Utc::now();
		self.error = None;
		self
	}

	#[must_use]
	pub fn failed(mut self, reason: impl Into<String>) -> Self {
		self.status = JobStatus::Failed;
		self.updated_at = Utc::now();
		self.error = Some(reason.into());
		self
	}

	/// A processing record whose owner has not finished within `max_duration + grace`.
	#[must_use]
	pub fn is_stale(&self, now: DateTime<Utc>, grace: Duration) -> bool {
		if self.status != JobStatus::Processing {
			return false;
		}
		let Some(started_at) = self.started_at else {
			return false;
		};
		let budget = Duration::from_secs(self.max_duration_secs) + grace;
		chrono::Duration::from_std(budget).map_or(false, |budget| now - started_at > budget)
	}
}
