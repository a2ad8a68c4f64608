// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	panic::{self, AssertUnwindSafe},
	sync::{
		Arc, OnceLock,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	thread::{self, Thread},
};

use parking_lot::Mutex;
use strand_core::report_uncaught_panic;

use crate::task::TaskWrapper;

/// The pool surface a worker reports back to. Workers hold this narrow
/// seam rather than the whole scheduler.
pub(crate) trait WorkerHost: Send + Sync {
	/// Runs a dequeued wrapper to completion.
	fn run_wrapper(&self, wrapper: &Arc<TaskWrapper>);

	/// Returns the worker to the pool after a task. A false return tells
	/// the worker to stop instead of parking for its next assignment.
	fn worker_done(&self, worker: &Arc<Worker>) -> bool;
}

/// A single-task-at-a-time pool thread, parked between assignments.
///
/// Hand-off is a slot write followed by an unpark; a wake with an empty
/// slot routes the thread to its stop check and back to parking.
pub(crate) struct Worker {
	slot: Mutex<Option<Arc<TaskWrapper>>>,
	thread: OnceLock<Thread>,
	stop: AtomicBool,
	idle_since_ms: AtomicU64,
}

impl Worker {
	pub(crate) fn new(now_ms: u64) -> Arc<Self> {
		Arc::new(Self {
			slot: Mutex::new(None),
			thread: OnceLock::new(),
			stop: AtomicBool::new(false),
			idle_since_ms: AtomicU64::new(now_ms),
		})
	}

	/// Assigns the next task and wakes the worker. Only ever called for a
	/// worker that is not in the idle deque (freshly created, or popped by
	/// the dispatching consumer), so assignments cannot race each other.
	pub(crate) fn next_task(&self, wrapper: Arc<TaskWrapper>) {
		*self.slot.lock() = Some(wrapper);
		if let Some(thread) = self.thread.get() {
			thread.unpark();
		}
	}

	/// Tells the worker to stop once its slot is empty.
	pub(crate) fn kill(&self) {
		self.stop.store(true, Ordering::Release);
		if let Some(thread) = self.thread.get() {
			thread.unpark();
		}
	}

	pub(crate) fn is_stopped(&self) -> bool {
		self.stop.load(Ordering::Acquire)
	}

	pub(crate) fn mark_idle(&self, now_ms: u64) {
		self.idle_since_ms.store(now_ms, Ordering::Release);
	}

	pub(crate) fn idle_since_ms(&self) -> u64 {
		self.idle_since_ms.load(Ordering::Acquire)
	}

	/// The worker thread body. Panics from the run path are forwarded to
	/// the uncaught-panic hook so `worker_done` always follows a task.
	pub(crate) fn run_loop(self: Arc<Self>, host: Arc<dyn WorkerHost>) {
		let _ = self.thread.set(thread::current());
		loop {
			let next = self.slot.lock().take();
			if let Some(wrapper) = next {
				if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| host.run_wrapper(&wrapper))) {
					report_uncaught_panic(payload);
				}
				if !host.worker_done(&self) {
					break;
				}
				continue;
			}
			if self.is_stopped() {
				break;
			}
			thread::park();
		}
	}
}
