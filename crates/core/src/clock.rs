// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	sync::atomic::{AtomicU64, Ordering},
	time::Instant,
};

/// Monotonic, forward-progressing millisecond source.
///
/// Two accessors are offered: [`Clock::millis`] returns the last cached
/// reading without touching the OS clock, while [`Clock::accurate_millis`]
/// refreshes the cache. Queue operations snapshot one accurate reading at
/// their start and use it for every comparison within the operation, which
/// keeps ordering stable while items are being placed.
pub struct Clock {
	origin: Instant,
	cached_ms: AtomicU64,
}

impl Clock {
	pub fn new() -> Self {
		Self {
			origin: Instant::now(),
			cached_ms: AtomicU64::new(0),
		}
	}

	/// Last cached reading, in milliseconds since the clock was created.
	///
	/// Cheap, but only as fresh as the most recent accurate read.
	pub fn millis(&self) -> u64 {
		self.cached_ms.load(Ordering::Relaxed)
	}

	/// Reads the OS clock, refreshes the cache, and returns the reading.
	///
	/// The cache only ever moves forward, even under concurrent refreshes.
	pub fn accurate_millis(&self) -> u64 {
		let now = self.origin.elapsed().as_millis() as u64;
		self.cached_ms.fetch_max(now, Ordering::Relaxed);
		now
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}
