#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Wall-clock milliseconds clamped to never go backwards. Stores use this
/// as their timestamp source so `created_at` stays non-decreasing per
/// process even when the system clock steps back.
#[derive(Debug, Default)]
pub struct MonotonicMillis {
	last: AtomicI64,
}

impl MonotonicMillis {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn now(&self) -> i64 {
		let wall = unix_ms_now();
		let prev = self.last.fetch_max(wall, Ordering::AcqRel);
		wall.max(prev)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monotonic_millis_never_decreases() {
		let clock = MonotonicMillis::new();
		let mut last = clock.now();
		for _ in 0..1000 {
			let now = clock.now();
			assert!(now >= last);
			last = now;
		}
	}
}
