use crate::error::LocalizeError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	/// Total number of tries, including the first one.
	pub max_attempts: u32,
	pub base_delay: Duration,
	/// Multiplier applied to the delay after every failed attempt.
	pub factor: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_secs(1),
			factor: 2,
		}
	}
}

impl RetryPolicy {
	#[must_use]
	pub fn backoff(&self, attempt: u32) -> Duration {
		self.base_delay * self.factor.saturating_pow(attempt.saturating_sub(1))
	}
}

/// Retry an async operation with exponential backoff.
/// - `operation` receives the 1-based attempt number
/// - `should_retry` decides whether an error is worth another attempt
///
/// Returns `Ok(T)` on success or the error from the last attempt.
pub async fn retry_with_backoff<F, Fut, T, P>(policy: &RetryPolicy, label: &str, should_retry: P, mut operation: F) -> Result<T, LocalizeError>
where
	F: FnMut(u32) -> Fut,
	Fut: Future<Output = Result<T, LocalizeError>>,
	P: Fn(&LocalizeError) -> bool,
{
	let mut attempt = 0;

	loop {
		attempt += 1;
		match operation(attempt).await {
			Ok(result) => return Ok(result),
			Err(err) if attempt >= policy.max_attempts || !should_retry(&err) => return Err(err),
			Err(err) => {
				let backoff = policy.backoff(attempt);
				warn!(label, attempt, max_attempts = policy.max_attempts, backoff_ms = backoff.as_millis(), error = %err, "Attempt failed, retrying");
				sleep(backoff).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn fast() -> RetryPolicy {
		RetryPolicy {
			max_attempts: 3,
			base_delay: Duration::from_millis(1),
			factor: 2,
		}
	}

	#[test]
	fn test_backoff_grows_exponentially() {
		let policy = RetryPolicy::default();
		assert_eq!(policy.backoff(1), Duration::from_secs(1));
		assert_eq!(policy.backoff(2), Duration::from_secs(2));
		assert_eq!(policy.backoff(3), Duration::from_secs(4));
	}

	#[tokio::test]
	async fn test_succeeds_after_transient_failures() {
		let calls = AtomicU32::new(0);
		let result = retry_with_backoff(&fast(), "test", LocalizeError::is_transient, |attempt| {
			calls.fetch_add(1, Ordering::SeqCst);
			async move {
				if attempt < 3 {
					Err(LocalizeError::Provider {
						provider: "fake",
						status: 503,
						body: String::new(),
					})
				} else {
					Ok(attempt)
				}
			}
		})
		.await;

		assert_eq!(result.unwrap(), 3);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn test_permanent_error_is_not_retried() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = retry_with_backoff(&fast(), "test", LocalizeError::is_transient, |_| {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(LocalizeError::Subtitle("garbage".to_string())) }
		})
		.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_gives_up_after_max_attempts() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = retry_with_backoff(&fast(), "test", |_| true, |_| {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(LocalizeError::Subtitle("garbage".to_string())) }
		})
		.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
