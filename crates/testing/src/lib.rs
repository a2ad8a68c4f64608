// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

//! Shared helpers for timing-sensitive scheduler tests: bounded condition
//! polling, a countdown latch, and an ordered event recorder.

use std::{
	thread,
	time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

/// Polls `cond` every few milliseconds until it holds or `timeout` elapses.
/// Returns whether the condition held.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
	let deadline = Instant::now() + timeout;
	loop {
		if cond() {
			return true;
		}
		if Instant::now() >= deadline {
			return cond();
		}
		thread::sleep(Duration::from_millis(2));
	}
}

/// Countdown latch signalled across threads.
pub struct Latch {
	remaining: Mutex<usize>,
	zero: Condvar,
}

impl Latch {
	pub fn new(count: usize) -> Self {
		Self {
			remaining: Mutex::new(count),
			zero: Condvar::new(),
		}
	}

	pub fn count_down(&self) {
		let mut remaining = self.remaining.lock();
		*remaining = remaining.saturating_sub(1);
		if *remaining == 0 {
			self.zero.notify_all();
		}
	}

	/// Blocks until the latch reaches zero or `timeout` elapses. Returns
	/// whether zero was reached.
	pub fn wait(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut remaining = self.remaining.lock();
		while *remaining > 0 {
			if self.zero.wait_until(&mut remaining, deadline).timed_out() {
				return *remaining == 0;
			}
		}
		true
	}
}

/// Ordered event sink for asserting execution order across threads.
pub struct Recorder<T> {
	events: Mutex<Vec<T>>,
}

impl<T: Clone> Recorder<T> {
	pub fn new() -> Self {
		Self {
			events: Mutex::new(Vec::new()),
		}
	}

	pub fn record(&self, event: T) {
		self.events.lock().push(event);
	}

	pub fn snapshot(&self) -> Vec<T> {
		self.events.lock().clone()
	}

	pub fn len(&self) -> usize {
		self.events.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.events.lock().is_empty()
	}
}

impl<T: Clone> Default for Recorder<T> {
	fn default() -> Self {
		Self::new()
	}
}
