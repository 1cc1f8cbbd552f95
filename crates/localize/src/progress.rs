//! Per-job, per-segment progress reporting.
//!
//! Workers write through [`ProgressTracker`] and callers poll [`ProgressTracker::summary`].
//! Reads are eventually consistent with respect to in-flight segment tasks.

use crate::transcript::TranscriptEntry;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
	Pending,
	Processing,
	Completed,
	Failed,
}

impl SegmentStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentMapping {
	pub segment_index: usize,
	pub start: f64,
	pub end: f64,
	pub text: String,
	pub audio_path: Option<PathBuf>,
	pub actual_duration: Option<f64>,
	/// Gap to the previous segment's end, 0 for the first segment.
	pub pause_before: f64,
	/// Gap to the next segment's start, 0 for the last segment.
	pub pause_after: f64,
	pub status: SegmentStatus,
	pub error: Option<String>,
}

/// Which unit of work a tracked job is counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
	/// One mapping per translation chunk.
	Translation,
	/// One mapping per synthesized segment.
	Synthesis,
}

impl fmt::Display for ProgressKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Translation => write!(f, "translation"),
			Self::Synthesis => write!(f, "synthesis"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
	Pending,
	Processing,
	Completed,
	/// Everything finished, some of it failed.
	Partial,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
	pub total: usize,
	pub completed: usize,
	pub failed: usize,
	pub processing: usize,
	pub percentage: f64,
	pub status: DerivedStatus,
}

impl ProgressSummary {
	fn from_segments<'a>(segments: impl Iterator<Item = &'a SegmentMapping>) -> Self {
		let (mut total, mut completed, mut failed, mut processing) = (0, 0, 0, 0);
		for segment in segments {
			total += 1;
			match segment.status {
				SegmentStatus::Completed => completed += 1,
				SegmentStatus::Failed => failed += 1,
				SegmentStatus::Processing => processing += 1,
				SegmentStatus::Pending => {}
			}
		}

		let finished = completed + failed;
		#[allow(clippy::cast_precision_loss)]
		let percentage = if total == 0 { 0.0 } else { finished as f64 * 100.0 / total as f64 };
		let status = if total == 0 || (finished == 0 && processing == 0) {
			DerivedStatus::Pending
		} else if finished < total {
			DerivedStatus::Processing
		} else if failed == 0 {
			DerivedStatus::Completed
		} else if completed == 0 {
			DerivedStatus::Failed
		} else {
			DerivedStatus::Partial
		};

		Self {
			total,
			completed,
			failed,
			processing,
			percentage,
			status,
		}
	}
}

struct JobProgress {
	segments: BTreeMap<usize, SegmentMapping>,
	touched: Instant,
}

type ProgressKey = (String, ProgressKind);

#[derive(Default)]
pub struct ProgressTracker {
	jobs: Mutex<HashMap<ProgressKey, JobProgress>>,
}

impl ProgressTracker {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<ProgressKey, JobProgress>> {
		self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn key(job_id: &str, kind: ProgressKind) -> ProgressKey {
		(job_id.to_string(), kind)
	}

	/// Registers every entry as a pending mapping with pauses derived from its neighbours.
	/// Re-registering a job replaces its previous mappings.
	pub fn register_segments(&self, job_id: &str, kind: ProgressKind, entries: &[TranscriptEntry]) {
		let mut segments = BTreeMap::new();
		for (pos, entry) in entries.iter().enumerate() {
			let pause_before = pos.checked_sub(1).map_or(0.0, |prev| (entry.start - entries[prev].end).max(0.0));
			let pause_after = entries.get(pos + 1).map_or(0.0, |next| (next.start - entry.end).max(0.0));
			segments.insert(
				entry.index,
				SegmentMapping {
					segment_index: entry.index,
					start: entry.start,
					end: entry.end,
					text: entry.text.clone(),
					audio_path: None,
					actual_duration: None,
					pause_before,
					pause_after,
					status: SegmentStatus::Pending,
					error: None,
				},
			);
		}

		debug!(job_id, %kind, total = segments.len(), "Registered progress segments");
		self.lock().insert(
			Self::key(job_id, kind),
			JobProgress {
				segments,
				touched: Instant::now(),
			},
		);
	}

	/// Adds one pending mapping identified by `unit_index` and described by `label`. Used for
	/// translation chunks, which are only known once the transcript is planned or re-split.
	pub fn register_unit(&self, job_id: &str, kind: ProgressKind, unit_index: usize, label: String) {
		let mut jobs = self.lock();
		let progress = jobs.entry(Self::key(job_id, kind)).or_insert_with(|| JobProgress {
			segments: BTreeMap::new(),
			touched: Instant::now(),
		});
		progress.touched = Instant::now();
		progress.segments.entry(unit_index).or_insert(SegmentMapping {
			segment_index: unit_index,
			start: 0.0,
			end: 0.0,
			text: label,
			audio_path: None,
			actual_duration: None,
			pause_before: 0.0,
			pause_after: 0.0,
			status: SegmentStatus::Pending,
			error: None,
		});
	}

	fn update<F>(&self, job_id: &str, kind: ProgressKind, segment_index: usize, apply: F) -> bool
	where
		F: FnOnce(&mut SegmentMapping),
	{
		let mut jobs = self.lock();
		let Some(progress) = jobs.get_mut(&Self::key(job_id, kind)) else {
			return false;
		};
		let Some(segment) = progress.segments.get_mut(&segment_index) else {
			return false;
		};
		// Terminal states are final.
		if segment.status.is_terminal() {
			return false;
		}
		apply(segment);
		progress.touched = Instant::now();
		true
	}

	pub fn mark_processing(&self, job_id: &str, kind: ProgressKind, segment_index: usize) -> bool {
		self.update(job_id, kind, segment_index, |segment| segment.status = SegmentStatus::Processing)
	}

	pub fn complete(&self, job_id: &str, kind: ProgressKind, segment_index: usize, audio_path: Option<PathBuf>, actual_duration: Option<f64>) -> bool {
		self.update(job_id, kind, segment_index, |segment| {
			segment.status = SegmentStatus::Completed;
			segment.audio_path = audio_path;
			segment.actual_duration = actual_duration;
		})
	}

	pub fn fail(&self, job_id: &str, kind: ProgressKind, segment_index: usize, error: impl Into<String>) -> bool {
		let error = error.into();
		self.update(job_id, kind, segment_index, |segment| {
			segment.status = SegmentStatus::Failed;
			segment.error = Some(error);
		})
	}

	#[must_use]
	pub fn segment(&self, job_id: &str, kind: ProgressKind, segment_index: usize) -> Option<SegmentMapping> {
		self.lock().get(&Self::key(job_id, kind)).and_then(|progress| progress.segments.get(&segment_index).cloned())
	}

	/// Snapshot of every mapping for the job, ordered by segment index.
	#[must_use]
	pub fn segments(&self, job_id: &str, kind: ProgressKind) -> Vec<SegmentMapping> {
		self.lock().get(&Self::key(job_id, kind)).map(|progress| progress.segments.values().cloned().collect()).unwrap_or_default()
	}

	#[must_use]
	pub fn summary(&self, job_id: &str, kind: ProgressKind) -> Option<ProgressSummary> {
		self.lock().get(&Self::key(job_id, kind)).map(|progress| ProgressSummary::from_segments(progress.segments.values()))
	}

	/// Drops every kind of progress recorded for the job.
	pub fn remove(&self, job_id: &str) -> usize {
		let mut jobs = self.lock();
		let before = jobs.len();
		jobs.retain(|(id, _), _| id != job_id);
		before - jobs.len()
	}

	/// Removes progress untouched for longer than `ttl`. Returns the number of entries removed.
	pub fn sweep_expired(&self, ttl: Duration) -> usize {
		let now = Instant::now();
		let mut jobs = self.lock();
		let before = jobs.len();
		jobs.retain(|_, progress| now.duration_since(progress.touched) < ttl);
		let removed = before - jobs.len();
		if removed > 0 {
			debug!(removed, "Swept expired job progress");
		}
		removed
	}
}
