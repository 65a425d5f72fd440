//! The Proxy-Retry Throttler (§4.5): rate-limits retry of PAC evaluations
//! and proxy endpoints that returned a hard failure, following a fixed
//! backoff schedule. Grounded on the "idempotent within a load cycle" rule
//! observed in naiveproxy's `configured_proxy_resolution_service.h`: once a
//! retry is armed, further failures observed before it fires do not re-arm
//! or extend the delay.

use std::time::{Duration, Instant};

const SCHEDULE: [Duration; 4] = [
	Duration::from_secs(8),
	Duration::from_secs(32),
	Duration::from_secs(120),
	Duration::from_secs(14_400),
];

#[derive(Debug, Clone, Default)]
pub struct RetryInfo {
	consecutive_failures: u32,
	next_retry_time: Option<Instant>,
}

impl RetryInfo {
	pub fn new() -> Self {
		Self::default()
	}

	fn current_delay(&self) -> Duration {
		let index = (self.consecutive_failures as usize).min(SCHEDULE.len() - 1);
		SCHEDULE[index]
	}

	/// Arms a one-shot retry timer if none is currently scheduled. Returns
	/// the instant the retry becomes allowed; repeated calls within the same
	/// load cycle (i.e. before that instant passes) are no-ops.
	pub fn on_runtime_failure(&mut self) -> Instant {
		if let Some(at) = self.next_retry_time {
			if Instant::now() < at {
				return at;
			}
		}
		self.consecutive_failures = self.consecutive_failures.saturating_add(1);
		let at = Instant::now() + self.current_delay();
		self.next_retry_time = Some(at);
		at
	}

	/// Whether a retry is currently allowed (no timer armed, or the armed
	/// timer has elapsed).
	pub fn is_retry_allowed(&self) -> bool {
		self.next_retry_time.is_none_or(|at| Instant::now() >= at)
	}

	/// Called on an observed success; clears the failure count and any
	/// armed timer.
	pub fn reset(&mut self) {
		self.consecutive_failures = 0;
		self.next_retry_time = None;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn repeated_failures_within_a_cycle_do_not_rearm() {
		let mut info = RetryInfo::new();
		let first = info.on_runtime_failure();
		let second = info.on_runtime_failure();
		assert_eq!(first, second);
	}

	#[test]
	fn reset_clears_schedule_progress() {
		let mut info = RetryInfo::new();
		info.on_runtime_failure();
		info.reset();
		assert!(info.is_retry_allowed());
		assert_eq!(info.consecutive_failures, 0);
	}

	#[test]
	fn delay_saturates_at_the_final_schedule_step() {
		let mut info = RetryInfo::new();
		info.consecutive_failures = 10;
		assert_eq!(info.current_delay(), Duration::from_secs(14_400));
	}
}
