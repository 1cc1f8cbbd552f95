use crate::pipeline::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocalizeError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("{provider} returned {status}: {body}")]
	Provider { provider: &'static str, status: u16, body: String },

	#[error("No rate limit slot granted within {0:?}")]
	RateLimited(Duration),

	#[error("{operation} timed out after {timeout:?}")]
	Timeout { operation: String, timeout: Duration },

	#[error("{tool} failed ({status}): {stderr}")]
	ToolFailed { tool: String, status: String, stderr: String },

	#[error("Input file does not exist: {0}")]
	InputMissing(PathBuf),

	#[error("Malformed subtitle data: {0}")]
	Subtitle(String),

	#[error("Chunk {chunk_id} covering entries [{start}, {end}) failed: {reason}")]
	ChunkFailed { chunk_id: usize, start: usize, end: usize, reason: String },

	#[error("Synthesis produced no audio for any of {0} segments")]
	NoAudio(usize),

	#[error("Stage {stage} failed: {source}")]
	StageFailed {
		stage: Stage,
		#[source]
		source: Box<LocalizeError>,
	},

	#[error("Credit ledger rejected the request: {0}")]
	Credits(String),

	#[error("Task panicked: {0}")]
	Panicked(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("Job queue error: {0}")]
	Queue(#[from] task_queue::TaskQueueError),
}

impl LocalizeError {
	/// Network and provider hiccups worth another attempt.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429),
			Self::Provider { status, .. } => *status == 429 || *status >= 500,
			Self::Timeout { .. } => true,
			_ => false,
		}
	}

	pub fn in_stage(self, stage: Stage) -> Self {
		match self {
			Self::StageFailed { .. } => self,
			other => Self::StageFailed { stage, source: Box::new(other) },
		}
	}

	/// Stage a pipeline failure is attributed to, when known.
	#[must_use]
	pub const fn failed_stage(&self) -> Option<Stage> {
		match self {
			Self::StageFailed { stage, .. } => Some(*stage),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_transient_classification() {
		let throttled = LocalizeError::Provider {
			provider: "openai",
			status: 429,
			body: String::new(),
		};
		let rejected = LocalizeError::Provider {
			provider: "openai",
			status: 400,
			body: "bad voice".to_string(),
		};
		assert!(throttled.is_transient());
		assert!(!rejected.is_transient());
		assert!(LocalizeError::Timeout {
			operation: "synthesize".to_string(),
			timeout: Duration::from_secs(1)
		}
		.is_transient());
		assert!(!LocalizeError::InputMissing(PathBuf::from("x")).is_transient());
	}

	#[test]
	fn test_stage_wrapping_is_idempotent() {
		let err = LocalizeError::NoAudio(3).in_stage(Stage::Synthesize).in_stage(Stage::Assemble);
		assert_eq!(err.failed_stage(), Some(Stage::Synthesize));
		assert!(err.to_string().contains("synthesize"));
	}
}
