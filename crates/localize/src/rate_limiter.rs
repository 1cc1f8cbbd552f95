//! Sliding-window admission control for the speech-synthesis provider.
//!
//! The limiter counts reservations in the trailing `window`. A reservation is granted only while
//! that count is below `max_requests`, so provider quota holds no matter how many logical tasks
//! are waiting.

use crate::error::LocalizeError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
	pub max_requests: usize,
	pub window: Duration,
	/// Fixed pause between slot checks in [`RateLimiter::wait_for_slot`].
	pub poll_interval: Duration,
}

impl Default for RateLimiterConfig {
	fn default() -> Self {
		Self {
			max_requests: 60,
			window: Duration::from_secs(60),
			poll_interval: Duration::from_millis(100),
		}
	}
}

pub struct RateLimiter {
	config: RateLimiterConfig,
	// Pushed in arrival order, so the oldest timestamp is always at the front.
	window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
	#[must_use]
	pub fn new(config: RateLimiterConfig) -> Self {
		Self {
			config,
			window: Mutex::new(VecDeque::with_capacity(config.max_requests)),
		}
	}

	#[must_use]
	pub const fn config(&self) -> &RateLimiterConfig {
		&self.config
	}

	fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
		self.window.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn live_count(&self, timestamps: &VecDeque<Instant>, now: Instant) -> usize {
		let expired = timestamps.partition_point(|t| now.duration_since(*t) >= self.config.window);
		timestamps.len() - expired
	}

	/// True while the trailing window holds fewer reservations than the cap.
	pub fn can_reserve(&self) -> bool {
		let timestamps = self.lock();
		self.live_count(&timestamps, Instant::now()) < self.config.max_requests
	}

	/// Records a reservation unconditionally. Check [`Self::can_reserve`] first.
	pub fn reserve(&self) {
		self.lock().push_back(Instant::now());
	}

	/// Check-and-reserve under a single lock.
	pub fn try_reserve(&self) -> bool {
		let now = Instant::now();
		let mut timestamps = self.lock();
		Self::prune(&mut timestamps, now, self.config.window);
		if timestamps.len() < self.config.max_requests {
			timestamps.push_back(now);
			true
		} else {
			false
		}
	}

	/// Polls at a fixed interval until a slot is reserved or `timeout` elapses.
	///
	/// # Errors
	/// Returns `RateLimited` when no slot frees up in time
	pub async fn wait_for_slot(&self, timeout: Duration) -> Result<(), LocalizeError> {
		let started = Instant::now();

		loop {
			if self.try_reserve() {
				trace!(waited_ms = started.elapsed().as_millis(), "Rate limit slot reserved");
				return Ok(());
			}
			if started.elapsed() >= timeout {
				return Err(LocalizeError::RateLimited(timeout));
			}
			sleep(self.config.poll_interval).await;
		}
	}

	/// Reservations currently inside the window.
	pub fn in_flight(&self) -> usize {
		let timestamps = self.lock();
		self.live_count(&timestamps, Instant::now())
	}

	/// Drops timestamps that have left the window. Returns how many were removed.
	pub fn sweep(&self) -> usize {
		let mut timestamps = self.lock();
		Self::prune(&mut timestamps, Instant::now(), self.config.window)
	}

	fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) -> usize {
		let mut removed = 0;
		while timestamps.front().is_some_and(|t| now.duration_since(*t) >= window) {
			timestamps.pop_front();
			removed += 1;
		}
		removed
	}

	pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
		let limiter = Arc::clone(self);
		tokio::spawn(async move {
			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					() = sleep(interval) => {
						let removed = limiter.sweep();
						if removed > 0 {
							debug!(removed, "Swept expired rate limit entries");
						}
					}
				}
			}
		})
	}
}
