use crate::error::LocalizeError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// One timed line of a transcript. `index` order is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
	pub index: usize,
	/// Seconds from the start of the media.
	pub start: f64,
	pub end: f64,
	pub text: String,
}

impl TranscriptEntry {
	pub fn new(index: usize, start: f64, end: f64, text: impl Into<String>) -> Self {
		Self {
			index,
			start,
			end,
			text: text.into(),
		}
	}

	#[must_use]
	pub fn duration(&self) -> f64 {
		(self.end - self.start).max(0.0)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
	pub language: Option<String>,
	pub text: String,
	pub entries: Vec<TranscriptEntry>,
}

impl Transcript {
	#[must_use]
	pub fn new(language: Option<String>, entries: Vec<TranscriptEntry>) -> Self {
		let text = entries.iter().map(|e| e.text.trim()).filter(|t| !t.is_empty()).collect::<Vec<_>>().join(" ");
		Self { language, text, entries }
	}

	#[must_use]
	pub fn to_srt(&self) -> String {
		to_srt(&self.entries)
	}
}

/// Formats seconds as `HH:MM:SS,mmm`.
#[must_use]
pub fn format_timestamp(seconds: f64) -> String {
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
	let (hours, rest) = (total_ms / 3_600_000, total_ms % 3_600_000);
	let (minutes, rest) = (rest / 60_000, rest % 60_000);
	let (secs, millis) = (rest / 1000, rest % 1000);
	format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

/// Parses `HH:MM:SS,mmm`. A `.` millisecond separator and a missing hour field are accepted.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<f64> {
	let raw = raw.trim().replace('.', ",");
	let (clock, millis) = raw.split_once(',').unwrap_or((raw.as_str(), "0"));
	let millis: f64 = millis.trim().parse::<u32>().ok().map(f64::from)?;

	let parts = clock.split(':').map(|p| p.trim().parse::<u32>().ok()).collect::<Option<Vec<_>>>()?;
	let (hours, minutes, secs) = match parts.as_slice() {
		[h, m, s] => (*h, *m, *s),
		[m, s] => (0, *m, *s),
		_ => return None,
	};

	Some(f64::from(hours) * 3600.0 + f64::from(minutes) * 60.0 + f64::from(secs) + millis / 1000.0)
}

#[must_use]
pub fn to_srt(entries: &[TranscriptEntry]) -> String {
	let mut out = String::new();
	for entry in entries {
		let _ = writeln!(out, "{}", entry.index);
		let _ = writeln!(out, "{} --> {}", format_timestamp(entry.start), format_timestamp(entry.end));
		let _ = writeln!(out, "{}", entry.text.trim());
		out.push('\n');
	}
	out
}

fn parse_block(lines: &[&str]) -> Option<TranscriptEntry> {
	let arrow = lines.iter().position(|line| line.contains("-->"))?;
	// The numeric index sits on the line directly above the timing line.
	let index = arrow.checked_sub(1).and_then(|i| lines[i].trim().parse::<usize>().ok())?;
	let (start, end) = lines[arrow].split_once("-->")?;
	let start = parse_timestamp(start)?;
	let end = parse_timestamp(end.split_whitespace().next()?)?;
	let text = lines[arrow + 1..].iter().map(|l| l.trim()).filter(|l| !l.is_empty()).collect::<Vec<_>>().join("\n");

	Some(TranscriptEntry { index, start, end, text })
}

/// Lenient SRT parser for model replies.
///
/// Markdown fences and blocks that do not parse are skipped.
///
/// # Errors
/// Returns `Subtitle` only when no block parses at all
pub fn parse_srt(raw: &str) -> Result<Vec<TranscriptEntry>, LocalizeError> {
	let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
	let mut entries = Vec::new();
	let mut block: Vec<&str> = Vec::new();
	let mut skipped = 0usize;

	let mut flush = |block: &mut Vec<&str>, entries: &mut Vec<TranscriptEntry>| {
		if block.is_empty() {
			return;
		}
		match parse_block(block) {
			Some(entry) => entries.push(entry),
			None => skipped += 1,
		}
		block.clear();
	};

	for line in normalized.lines() {
		let trimmed = line.trim();
		if trimmed.starts_with("```") {
			continue;
		}
		if trimmed.is_empty() {
			flush(&mut block, &mut entries);
		} else {
			block.push(line);
		}
	}
	flush(&mut block, &mut entries);

	if entries.is_empty() {
		let preview: String = raw.chars().take(80).collect();
		return Err(LocalizeError::Subtitle(format!("no parsable blocks ({skipped} skipped): {preview:?}")));
	}
	if skipped > 0 {
		tracing::debug!(skipped, parsed = entries.len(), "Skipped malformed subtitle blocks");
	}
	Ok(entries)
}

/// Positions (not indices) of entries whose start/end break non-decreasing order.
#[must_use]
pub fn timeline_violations(entries: &[TranscriptEntry]) -> Vec<usize> {
	entries
		.iter()
		.enumerate()
		.filter(|(pos, entry)| {
			let inverted = entry.end < entry.start;
			let regressed = pos.checked_sub(1).is_some_and(|prev| entry.start < entries[prev].start);
			inverted || regressed
		})
		.map(|(pos, _)| pos)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_timestamp_format_and_parse() {
		assert_eq!(format_timestamp(3723.456), "01:02:03,456");
		assert_eq!(format_timestamp(0.0), "00:00:00,000");
		assert!((parse_timestamp("01:02:03,456").unwrap() - 3723.456).abs() < 1e-9);
		assert!((parse_timestamp("00:00:01.500").unwrap() - 1.5).abs() < 1e-9);
		assert!((parse_timestamp("02:03,000").unwrap() - 123.0).abs() < 1e-9);
		assert!(parse_timestamp("not a time").is_none());
	}

	#[test]
	fn test_srt_output_layout() {
		let srt = to_srt(&[TranscriptEntry::new(1, 0.0, 1.25, " Hello "), TranscriptEntry::new(2, 1.5, 3.0, "World")]);
		assert_eq!(srt, "1\n00:00:00,000 --> 00:00:01,250\nHello\n\n2\n00:00:01,500 --> 00:00:03,000\nWorld\n\n");
	}

	#[test]
	fn test_parse_tolerates_model_noise() {
		let reply = "Here is your translation:\n```srt\n1\n00:00:00,000 --> 00:00:01,000\nHola\n\ngarbage block\n\n2\r\n00:00:01.000 --> 00:00:02.000\r\nQué tal\r\namigo\r\n```\n";
		let entries = parse_srt(reply).unwrap();

		assert_eq!(entries.len(), 2);
		assert_eq!(entries[0].text, "Hola");
		assert_eq!(entries[1].index, 2);
		assert_eq!(entries[1].text, "Qué tal\namigo");
		assert!((entries[1].end - 2.0).abs() < 1e-9);
	}

	#[test]
	fn test_parse_rejects_empty_reply() {
		assert!(matches!(parse_srt("I'm sorry, I can't help with that."), Err(LocalizeError::Subtitle(_))));
	}

	#[test]
	fn test_timeline_violations() {
		let entries = vec![
			TranscriptEntry::new(1, 0.0, 1.0, "a"),
			TranscriptEntry::new(2, 2.0, 1.5, "b"),
			TranscriptEntry::new(3, 1.0, 3.0, "c"),
		];
		assert_eq!(timeline_violations(&entries), vec![1, 2]);
		assert!(timeline_violations(&entries[..1]).is_empty());
	}

	#[test]
	fn test_transcript_text_joins_entries() {
		let transcript = Transcript::new(Some("en".to_string()), vec![TranscriptEntry::new(1, 0.0, 1.0, "Hello"), TranscriptEntry::new(2, 1.0, 2.0, " world ")]);
		assert_eq!(transcript.text, "Hello world");
	}
}
