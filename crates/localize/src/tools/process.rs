use crate::error::LocalizeError;
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Captured output of a finished external program.
#[derive(Debug, Clone)]
pub struct ToolOutput {
	pub stdout: Vec<u8>,
	pub stderr: String,
	pub elapsed: Duration,
}

// Tail is enough to see why ffmpeg gave up.
const STDERR_TAIL: usize = 2000;

fn tail(stderr: &str) -> String {
	let trimmed = stderr.trim();
	let cut = trimmed.len().saturating_sub(STDERR_TAIL);
	let start = (cut..=trimmed.len()).find(|&i| trimmed.is_char_boundary(i)).unwrap_or(trimmed.len());
	trimmed[start..].to_string()
}

/// Runs `program` to completion with a hard deadline.
///
/// The child is killed when the deadline passes or when the returned future is dropped.
///
/// # Errors
/// - `Timeout` when `limit` elapses
/// - `ToolFailed` when the program cannot start or exits non-zero
pub async fn run_tool<I, S>(program: &str, args: I, limit: Duration) -> Result<ToolOutput, LocalizeError>
where
	I: IntoIterator<Item = S>,
	S: AsRef<OsStr>,
{
	let started = Instant::now();
	let child = Command::new(program)
		.args(args)
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true)
		.spawn()
		.map_err(|e| LocalizeError::ToolFailed {
			tool: program.to_string(),
			status: "spawn".to_string(),
			stderr: e.to_string(),
		})?;

	let output = match timeout(limit, child.wait_with_output()).await {
		Ok(output) => output?,
		Err(_) => {
			warn!(program, timeout_secs = limit.as_secs_f64(), "External tool timed out, killed");
			return Err(LocalizeError::Timeout {
				operation: program.to_string(),
				timeout: limit,
			});
		}
	};

	let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
	if !output.status.success() {
		return Err(LocalizeError::ToolFailed {
			tool: program.to_string(),
			status: output.status.to_string(),
			stderr: tail(&stderr),
		});
	}

	let elapsed = started.elapsed();
	debug!(program, elapsed_ms = elapsed.as_millis(), "External tool finished");
	Ok(ToolOutput {
		stdout: output.stdout,
		stderr,
		elapsed,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_captures_stdout() {
		let output = run_tool("sh", ["-c", "printf hello"], Duration::from_secs(5)).await.unwrap();
		assert_eq!(output.stdout, b"hello");
	}

	#[tokio::test]
	async fn test_non_zero_exit_is_tool_failure() {
		let err = run_tool("sh", ["-c", "echo boom >&2; exit 3"], Duration::from_secs(5)).await.unwrap_err();
		match err {
			LocalizeError::ToolFailed { tool, stderr, .. } => {
				assert_eq!(tool, "sh");
				assert_eq!(stderr, "boom");
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[tokio::test]
	async fn test_deadline_kills_child() {
		let started = Instant::now();
		let err = run_tool("sleep", ["5"], Duration::from_millis(100)).await.unwrap_err();
		assert!(matches!(err, LocalizeError::Timeout { .. }));
		assert!(started.elapsed() < Duration::from_secs(2));
	}

	#[tokio::test]
	async fn test_missing_program() {
		let err = run_tool("definitely-not-a-real-binary", Vec::<String>::new(), Duration::from_secs(1)).await.unwrap_err();
		assert!(matches!(err, LocalizeError::ToolFailed { ref status, .. } if status == "spawn"));
	}

	#[test]
	fn test_tail_respects_char_boundaries() {
		let long = "é".repeat(STDERR_TAIL);
		let cut = tail(&long);
		assert!(cut.len() <= STDERR_TAIL);
		assert!(cut.chars().all(|c| c == 'é'));
	}
}
