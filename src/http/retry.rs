//! Retry utilities for upstream HTTP requests.

// crates.io
use reqwest::StatusCode;
use tokio::time;
// self
use crate::_prelude::*;

/// Cap applied to exponential backoff growth.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Whether an HTTP status is transient and worth retrying.
pub fn is_transient_status(status: StatusCode) -> bool {
	matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

/// Controls how many times an upstream call is reissued and the delay between attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
	/// Maximum number of retries performed after the initial attempt.
	pub max_retries: u32,
	/// Base delay doubled on every consecutive failure.
	pub backoff_factor: Duration,
	/// Upper bound applied to exponential backoff growth.
	pub max_backoff: Duration,
}
impl RetryPolicy {
	/// Policy for list-endpoint requests.
	pub fn transport() -> Self {
		Self { max_retries: 3, backoff_factor: Duration::from_secs(2), max_backoff: MAX_BACKOFF }
	}

	/// Policy for token-endpoint requests.
	pub fn auth() -> Self {
		Self { max_retries: 5, backoff_factor: Duration::from_secs(1), max_backoff: MAX_BACKOFF }
	}

	/// Compute the backoff delay for a zero-based retry attempt.
	pub fn compute_backoff(&self, attempt: u32) -> Duration {
		let exponent = attempt.min(16);

		self.backoff_factor.mul_f64(2f64.powi(exponent as i32)).min(self.max_backoff)
	}
}

/// Tracks retry progression for a single logical request.
#[derive(Debug)]
pub struct RetryExecutor<'a> {
	policy: &'a RetryPolicy,
	retries_used: u32,
}
impl<'a> RetryExecutor<'a> {
	/// Create a new executor respecting the supplied retry policy.
	pub fn new(policy: &'a RetryPolicy) -> Self {
		Self { policy, retries_used: 0 }
	}

	/// Whether another retry is permitted under the policy.
	pub fn can_retry(&self) -> bool {
		self.retries_used < self.policy.max_retries
	}

	/// Number of retries that have already been consumed.
	pub fn attempts_used(&self) -> u32 {
		self.retries_used
	}

	/// Advance retry state and compute the backoff delay for the next attempt.
	pub fn next_backoff(&mut self) -> Option<Duration> {
		if !self.can_retry() {
			tracing::debug!(attempt = self.retries_used, "retry budget exhausted");

			return None;
		}

		let attempt = self.retries_used;

		self.retries_used = self.retries_used.saturating_add(1);

		let delay = self.policy.compute_backoff(attempt);

		tracing::debug!(attempt = attempt + 1, ?delay, "retry backoff computed");

		Some(delay)
	}

	/// Sleep for the computed backoff window if retrying is permitted.
	pub async fn sleep_backoff(&mut self) {
		if let Some(delay) = self.next_backoff()
			&& !delay.is_zero()
		{
			time::sleep(delay).await;
		}
	}
}
