//! Chunked translation of long transcripts.
//!
//! A transcript longer than one chunk is cut into overlapping windows that are translated
//! concurrently. Windows that keep failing are split in half until they either succeed or
//! reach the minimum size. Results are stitched back together in chunk order, so the first
//! chunk to cover an entry wins.

use crate::error::LocalizeError;
use crate::progress::{ProgressKind, ProgressTracker};
use crate::providers::Translator;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transcript::{parse_srt, timeline_violations, to_srt, TranscriptEntry};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct TranslatorConfig {
	pub max_chunk_size: usize,
	pub overlap: usize,
	pub concurrency: usize,
	pub chunk_timeout: Duration,
	pub retry: RetryPolicy,
	/// Re-splitting stops here. A chunk of this size that still fails fails the translation.
	pub min_chunk_size: usize,
	/// Allowed difference between merged and source entry counts before warning.
	pub count_tolerance: usize,
}

impl Default for TranslatorConfig {
	fn default() -> Self {
		Self {
			max_chunk_size: 50,
			overlap: 5,
			concurrency: 5,
			chunk_timeout: Duration::from_secs(60),
			retry: RetryPolicy::default(),
			min_chunk_size: 10,
			count_tolerance: 5,
		}
	}
}

/// A window over `entries[start_index..end_index]`.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
	pub chunk_id: usize,
	pub start_index: usize,
	pub end_index: usize,
	/// SRT rendering of the covered entries.
	pub content: String,
	/// Translator calls spent on this chunk, including calls for re-split halves.
	pub retry_count: u32,
	pub result: Option<Vec<TranscriptEntry>>,
	pub error: Option<String>,
}

impl Chunk {
	#[must_use]
	pub const fn len(&self) -> usize {
		self.end_index - self.start_index
	}

	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
	pub expected: usize,
	pub merged: usize,
	pub dropped_duplicates: usize,
	pub dropped_out_of_range: usize,
	/// Chunks whose entries came back renumbered and were paired with the source by position.
	pub renumbered_chunks: usize,
	pub count_mismatch: bool,
	/// Positions in the merged output that break timeline order.
	pub timeline_violations: Vec<usize>,
}

impl MergeReport {
	#[must_use]
	pub fn is_clean(&self) -> bool {
		!self.count_mismatch && self.timeline_violations.is_empty()
	}
}

#[derive(Debug, Clone)]
pub struct TranslationOutput {
	pub entries: Vec<TranscriptEntry>,
	pub report: MergeReport,
	pub chunks: Vec<Chunk>,
}

/// Half-open windows of `size` entries, consecutive windows sharing `overlap` entries.
///
/// The last window is clipped to `len`. No window is emitted that would only repeat the tail
/// of its predecessor.
#[must_use]
pub fn plan_windows(len: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
	if len == 0 {
		return Vec::new();
	}
	let size = size.max(1);
	if len <= size {
		return vec![(0, len)];
	}

	let stride = size.saturating_sub(overlap).max(1);
	let mut windows = Vec::new();
	let mut start = 0;
	loop {
		let end = (start + size).min(len);
		windows.push((start, end));
		if end == len {
			break;
		}
		start += stride;
	}
	windows
}

/// Stitches translated chunks back onto the source timeline.
///
/// Chunks are visited in `chunk_id` order. An index already emitted is dropped. So is an
/// index the chunk never covered, unless none of the chunk's indices fall in its range and the
/// entry count matches, in which case entries are paired with the source by position. Start and
/// end always come from the source entry.
#[must_use]
pub fn merge_chunks(source: &[TranscriptEntry], chunks: &[Chunk], count_tolerance: usize) -> (Vec<TranscriptEntry>, MergeReport) {
	let mut ordered: Vec<&Chunk> = chunks.iter().collect();
	ordered.sort_by_key(|chunk| chunk.chunk_id);

	let mut report = MergeReport {
		expected: source.len(),
		..MergeReport::default()
	};
	let mut seen = HashSet::new();
	let mut merged = Vec::with_capacity(source.len());

	for chunk in ordered {
		let Some(result) = &chunk.result else { continue };
		let span = &source[chunk.start_index..chunk.end_index];
		let covered: HashMap<usize, &TranscriptEntry> = span.iter().map(|e| (e.index, e)).collect();

		// Models sometimes restart numbering at 1 for every chunk.
		let renumbered = !result.is_empty() && result.len() == span.len() && !result.iter().any(|e| covered.contains_key(&e.index));
		if renumbered {
			report.renumbered_chunks += 1;
		}

		for (position, translated) in result.iter().enumerate() {
			let original = if renumbered { span.get(position) } else { covered.get(&translated.index).copied() };
			let Some(original) = original else {
				report.dropped_out_of_range += 1;
				continue;
			};
			if !seen.insert(original.index) {
				report.dropped_duplicates += 1;
				continue;
			}
			merged.push(TranscriptEntry {
				index: original.index,
				start: original.start,
				end: original.end,
				text: translated.text.clone(),
			});
		}
	}

	merged.sort_by_key(|entry| entry.index);
	report.merged = merged.len();
	report.count_mismatch = merged.len().abs_diff(source.len()) > count_tolerance;
	report.timeline_violations = timeline_violations(&merged);
	(merged, report)
}

fn should_retry(err: &LocalizeError) -> bool {
	err.is_transient() || matches!(err, LocalizeError::Subtitle(_))
}

pub struct ChunkedTranslator {
	translator: Arc<dyn Translator>,
	config: TranslatorConfig,
	progress: Option<Arc<ProgressTracker>>,
}

impl ChunkedTranslator {
	#[must_use]
	pub fn new(translator: Arc<dyn Translator>, config: TranslatorConfig, progress: Option<Arc<ProgressTracker>>) -> Self {
		Self { translator, config, progress }
	}

	#[must_use]
	pub const fn config(&self) -> &TranslatorConfig {
		&self.config
	}

	/// Translate `entries` into `target_language`.
	///
	/// # Errors
	/// Returns `ChunkFailed` when any chunk keeps failing down to the minimum chunk size
	#[instrument(skip(self, entries), fields(entries = entries.len(), translator = self.translator.name()))]
	pub async fn translate(&self, job_id: Option<&str>, entries: &[TranscriptEntry], target_language: &str) -> Result<TranslationOutput, LocalizeError> {
		let windows = plan_windows(entries.len(), self.config.max_chunk_size, self.config.overlap);
		if windows.is_empty() {
			return Ok(TranslationOutput {
				entries: Vec::new(),
				report: MergeReport::default(),
				chunks: Vec::new(),
			});
		}

		let chunks: Vec<Chunk> = windows
			.iter()
			.enumerate()
			.map(|(chunk_id, &(start_index, end_index))| Chunk {
				chunk_id,
				start_index,
				end_index,
				content: to_srt(&entries[start_index..end_index]),
				retry_count: 0,
				result: None,
				error: None,
			})
			.collect();

		if let (Some(progress), Some(job_id)) = (&self.progress, job_id) {
			for chunk in &chunks {
				progress.register_unit(job_id, ProgressKind::Translation, chunk.chunk_id, format!("entries [{}, {})", chunk.start_index, chunk.end_index));
			}
		}
		info!(chunks = chunks.len(), target_language, "Translating transcript");

		let finished: Vec<Chunk> = futures::stream::iter(chunks.into_iter().map(|chunk| self.run_chunk(job_id, entries, chunk, target_language)))
			.buffer_unordered(self.config.concurrency.max(1))
			.collect()
			.await;

		if let Some(failed) = finished.iter().filter(|chunk| chunk.error.is_some()).min_by_key(|chunk| chunk.chunk_id) {
			return Err(LocalizeError::ChunkFailed {
				chunk_id: failed.chunk_id,
				start: failed.start_index,
				end: failed.end_index,
				reason: failed.error.clone().unwrap_or_default(),
			});
		}

		let (merged, report) = merge_chunks(entries, &finished, self.config.count_tolerance);
		if report.count_mismatch {
			warn!(expected = report.expected, merged = report.merged, "Merged translation entry count is off");
		}
		if !report.timeline_violations.is_empty() {
			warn!(violations = ?report.timeline_violations, "Merged translation timeline is not monotonic");
		}
		if report.dropped_duplicates > 0 || report.dropped_out_of_range > 0 {
			debug!(duplicates = report.dropped_duplicates, out_of_range = report.dropped_out_of_range, "Dropped entries while merging");
		}

		Ok(TranslationOutput {
			entries: merged,
			report,
			chunks: finished,
		})
	}

	async fn run_chunk(&self, job_id: Option<&str>, entries: &[TranscriptEntry], mut chunk: Chunk, target_language: &str) -> Chunk {
		let tracked = self.progress.as_deref().zip(job_id);
		if let Some((progress, job_id)) = tracked {
			progress.mark_processing(job_id, ProgressKind::Translation, chunk.chunk_id);
		}

		let calls = AtomicU32::new(0);
		let outcome = self.translate_range(entries, chunk.start_index, chunk.end_index, target_language, &calls).await;
		chunk.retry_count = calls.load(Ordering::Relaxed);

		match outcome {
			Ok(result) => {
				debug!(chunk_id = chunk.chunk_id, translated = result.len(), calls = chunk.retry_count, "Chunk translated");
				if let Some((progress, job_id)) = tracked {
					progress.complete(job_id, ProgressKind::Translation, chunk.chunk_id, None, None);
				}
				chunk.result = Some(result);
			}
			Err(err) => {
				warn!(chunk_id = chunk.chunk_id, start = chunk.start_index, end = chunk.end_index, error = %err, "Chunk failed");
				if let Some((progress, job_id)) = tracked {
					progress.fail(job_id, ProgressKind::Translation, chunk.chunk_id, err.to_string());
				}
				chunk.error = Some(err.to_string());
			}
		}
		chunk
	}

	/// Translates `entries[start..end]`, halving the range on persistent failure.
	fn translate_range<'a>(&'a self, entries: &'a [TranscriptEntry], start: usize, end: usize, target_language: &'a str, calls: &'a AtomicU32) -> BoxFuture<'a, Result<Vec<TranscriptEntry>, LocalizeError>> {
		async move {
			let len = end - start;
			match self.translate_once(&entries[start..end], target_language, calls).await {
				Ok(result) => Ok(result),
				Err(err) if len > self.config.min_chunk_size => {
					let half = (len / 2).max(self.config.min_chunk_size);
					warn!(start, end, half, error = %err, "Chunk kept failing, splitting");
					let mut left = self.translate_range(entries, start, start + half, target_language, calls).await?;
					let right = self.translate_range(entries, start + half, end, target_language, calls).await?;
					left.extend(right);
					Ok(left)
				}
				Err(err) => Err(err),
			}
		}
		.boxed()
	}

	async fn translate_once(&self, slice: &[TranscriptEntry], target_language: &str, calls: &AtomicU32) -> Result<Vec<TranscriptEntry>, LocalizeError> {
		let content = to_srt(slice);
		let chunk_timeout = self.config.chunk_timeout;

		retry_with_backoff(&self.config.retry, "translate_chunk", should_retry, |_| {
			calls.fetch_add(1, Ordering::Relaxed);
			let content = &content;
			async move {
				let reply = timeout(chunk_timeout, self.translator.translate(content, target_language)).await.map_err(|_| LocalizeError::Timeout {
					operation: "translate chunk".to_string(),
					timeout: chunk_timeout,
				})??;
				parse_srt(&reply)
			}
		})
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::atomic::AtomicUsize;

	fn source(count: usize) -> Vec<TranscriptEntry> {
		(0..count)
			.map(|i| {
				let start = f64::from(u32::try_from(i).unwrap()) * 2.0;
				TranscriptEntry::new(i + 1, start, start + 1.5, format!("line {}", i + 1))
			})
			.collect()
	}

	fn fast_config() -> TranslatorConfig {
		TranslatorConfig {
			retry: RetryPolicy {
				max_attempts: 2,
				base_delay: Duration::from_millis(1),
				factor: 2,
			},
			..TranslatorConfig::default()
		}
	}

	/// Upper-cases every entry and rewrites the timings, so tests can tell the merge kept the source timeline.
	#[derive(Default)]
	struct ShoutingTranslator {
		calls: AtomicUsize,
		in_flight: AtomicUsize,
		peak: AtomicUsize,
		/// Inputs larger than this many entries are rejected.
		max_entries: Option<usize>,
	}

	#[async_trait]
	impl Translator for ShoutingTranslator {
		fn name(&self) -> &'static str {
			"shouting"
		}

		async fn translate(&self, text: &str, _target_language: &str) -> Result<String, LocalizeError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(5)).await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);

			let entries = parse_srt(text)?;
			if self.max_entries.is_some_and(|max| entries.len() > max) {
				return Err(LocalizeError::Provider {
					provider: "shouting",
					status: 400,
					body: "too long".to_string(),
				});
			}
			let shouted: Vec<_> = entries.into_iter().map(|e| TranscriptEntry::new(e.index, 0.0, 0.0, e.text.to_uppercase())).collect();
			Ok(to_srt(&shouted))
		}
	}

	#[test]
	fn test_windows_for_long_transcript() {
		assert_eq!(plan_windows(120, 50, 5), vec![(0, 50), (45, 95), (90, 120)]);
		assert_eq!(plan_windows(95, 50, 5), vec![(0, 50), (45, 95)]);
		assert_eq!(plan_windows(50, 50, 5), vec![(0, 50)]);
		assert_eq!(plan_windows(7, 50, 5), vec![(0, 7)]);
		assert!(plan_windows(0, 50, 5).is_empty());
	}

	#[tokio::test]
	async fn test_long_transcript_merges_to_unique_ordered_entries() {
		let entries = source(120);
		let fake = Arc::new(ShoutingTranslator::default());
		let translator = ChunkedTranslator::new(fake.clone(), fast_config(), None);

		let output = translator.translate(None, &entries, "es").await.unwrap();

		assert_eq!(output.chunks.len(), 3);
		assert_eq!(output.entries.len(), 120);
		assert!(output.entries.windows(2).all(|w| w[0].index < w[1].index));
		assert_eq!(output.report.dropped_duplicates, 10);
		assert!(output.report.is_clean());
		assert_eq!(output.entries[46].text, "LINE 47");
		assert!((output.entries[46].start - entries[46].start).abs() < f64::EPSILON);
		assert_eq!(fake.calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_short_transcript_is_one_call() {
		let fake = Arc::new(ShoutingTranslator::default());
		let translator = ChunkedTranslator::new(fake.clone(), fast_config(), None);

		let output = translator.translate(None, &source(30), "fr").await.unwrap();
		assert_eq!(output.entries.len(), 30);
		assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_chunk_concurrency_is_bounded() {
		let fake = Arc::new(ShoutingTranslator::default());
		let config = TranslatorConfig { concurrency: 2, ..fast_config() };
		let translator = ChunkedTranslator::new(fake.clone(), config, None);

		let output = translator.translate(None, &source(400), "de").await.unwrap();
		assert_eq!(output.entries.len(), 400);
		assert!(fake.peak.load(Ordering::SeqCst) <= 2);
	}

	#[tokio::test]
	async fn test_failing_chunk_is_split_until_it_fits() {
		let fake = Arc::new(ShoutingTranslator {
			max_entries: Some(12),
			..ShoutingTranslator::default()
		});
		let progress = Arc::new(ProgressTracker::new());
		let translator = ChunkedTranslator::new(fake.clone(), fast_config(), Some(progress.clone()));

		let output = translator.translate(Some("job-1"), &source(40), "es").await.unwrap();

		assert_eq!(output.entries.len(), 40);
		// 40 -> 20 + 20 -> 10 + 10 + 10 + 10
		assert_eq!(fake.calls.load(Ordering::SeqCst), 7);
		assert_eq!(output.chunks[0].retry_count, 7);
		let summary = progress.summary("job-1", ProgressKind::Translation).unwrap();
		assert_eq!(summary.completed, 1);
	}

	#[tokio::test]
	async fn test_chunk_failing_at_floor_fails_translation() {
		let fake = Arc::new(ShoutingTranslator {
			max_entries: Some(3),
			..ShoutingTranslator::default()
		});
		let progress = Arc::new(ProgressTracker::new());
		let translator = ChunkedTranslator::new(fake, fast_config(), Some(progress.clone()));

		let err = translator.translate(Some("job-2"), &source(40), "es").await.unwrap_err();
		assert!(matches!(err, LocalizeError::ChunkFailed { chunk_id: 0, start: 0, end: 40, .. }));
		assert_eq!(progress.summary("job-2", ProgressKind::Translation).unwrap().failed, 1);
	}

	#[test]
	fn test_merge_keeps_first_chunk_and_drops_strays() {
		let entries = source(8);
		let first = Chunk {
			chunk_id: 0,
			start_index: 0,
			end_index: 5,
			content: String::new(),
			retry_count: 1,
			result: Some((1..=5).map(|i| TranscriptEntry::new(i, 0.0, 0.0, format!("first {i}"))).collect()),
			error: None,
		};
		let mut second_result: Vec<_> = (4..=8).map(|i| TranscriptEntry::new(i, 0.0, 0.0, format!("second {i}"))).collect();
		second_result.push(TranscriptEntry::new(99, 0.0, 0.0, "hallucinated"));
		let second = Chunk {
			chunk_id: 1,
			start_index: 3,
			end_index: 8,
			content: String::new(),
			retry_count: 1,
			result: Some(second_result),
			error: None,
		};

		// Completion order must not matter.
		let (merged, report) = merge_chunks(&entries, &[second, first], 5);

		assert_eq!(merged.len(), 8);
		assert_eq!(merged[3].text, "first 4");
		assert_eq!(merged[5].text, "second 6");
		assert_eq!(report.dropped_duplicates, 2);
		assert_eq!(report.dropped_out_of_range, 1);
		assert!((merged[7].end - entries[7].end).abs() < f64::EPSILON);
	}

	#[test]
	fn test_merge_pairs_renumbered_chunk_by_position() {
		let entries = source(8);
		let first = Chunk {
			chunk_id: 0,
			start_index: 0,
			end_index: 5,
			content: String::new(),
			retry_count: 1,
			result: Some((1..=5).map(|i| TranscriptEntry::new(i, 0.0, 0.0, format!("first {i}"))).collect()),
			error: None,
		};
		// Covers source indices 4..=8 but the model numbered its answer 1..=5.
		let second = Chunk {
			chunk_id: 1,
			start_index: 3,
			end_index: 8,
			content: String::new(),
			retry_count: 1,
			result: Some((1..=5).map(|i| TranscriptEntry::new(i, 0.0, 0.0, format!("second {i}"))).collect()),
			error: None,
		};

		let (merged, report) = merge_chunks(&entries, &[first, second], 5);

		assert_eq!(merged.len(), 8);
		assert_eq!(merged.iter().map(|e| e.index).collect::<Vec<_>>(), (1..=8).collect::<Vec<_>>());
		assert_eq!(merged[3].text, "first 4");
		assert_eq!(merged[5].text, "second 3");
		assert_eq!(merged[7].text, "second 5");
		assert_eq!(report.renumbered_chunks, 1);
		assert_eq!(report.dropped_out_of_range, 0);
		assert_eq!(report.dropped_duplicates, 2);
		assert!(report.is_clean());
	}

	#[test]
	fn test_merge_flags_large_count_gap() {
		let entries = source(20);
		let chunk = Chunk {
			chunk_id: 0,
			start_index: 0,
			end_index: 20,
			content: String::new(),
			retry_count: 1,
			result: Some(entries[..10].to_vec()),
			error: None,
		};
		let (merged, report) = merge_chunks(&entries, &[chunk], 5);
		assert_eq!(merged.len(), 10);
		assert!(report.count_mismatch);
		assert!(!report.is_clean());
	}
}
