// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	panic::{self, AssertUnwindSafe},
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
};

use parking_lot::Mutex;
use strand_core::{Delayed, Dequeued, Job, TaskFailure, TaskFuture, report_uncaught_panic};

/// One of the two scheduling lanes. Not a numeric priority: `High` wins
/// worker contention outright, except for the low-priority fairness
/// tolerance applied while lows are already older.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
	High,
	Low,
}

/// Observes a wrapper-side cancel, so an attached future resolves.
pub(crate) trait CancelObserver: Send + Sync {
	fn canceled(&self);
}

impl<T: Send + 'static> CancelObserver for TaskFuture<T> {
	fn canceled(&self) {
		self.complete(Err(TaskFailure::Canceled));
	}
}

pub(crate) enum TaskKind {
	/// Runs once at its absolute due time.
	Once,
	/// Runs, rests for `rest_ms` after the body returns, runs again.
	FixedDelay { rest_ms: u64 },
	/// Drift-free: each due time is the previous plus `period_ms`.
	FixedRate { period_ms: u64 },
}

enum TaskBody {
	Once(Option<Job>),
	Repeated(Box<dyn FnMut() + Send>),
}

/// Envelope around a unit of user work while it lives in the scheduler.
///
/// A recurring wrapper is in exactly one place at all times: its priority
/// queue. While the body runs the wrapper stays queued but reports an
/// infinite delay (the `executing` flag), so the queue never hands it out a
/// second time; completing re-sorts it to its next due position.
pub(crate) struct TaskWrapper {
	priority: Priority,
	kind: TaskKind,
	shutdown_marker: bool,
	canceled: AtomicBool,
	executing: AtomicBool,
	next_run_ms: AtomicU64,
	body: Mutex<TaskBody>,
	observer: Mutex<Option<Arc<dyn CancelObserver>>>,
}

impl TaskWrapper {
	pub(crate) fn once(priority: Priority, run_at_ms: u64, job: Job) -> Self {
		Self::new(priority, TaskKind::Once, run_at_ms, TaskBody::Once(Some(job)), false)
	}

	pub(crate) fn fixed_delay(priority: Priority, run_at_ms: u64, rest_ms: u64, body: Box<dyn FnMut() + Send>) -> Self {
		Self::new(
			priority,
			TaskKind::FixedDelay {
				rest_ms,
			},
			run_at_ms,
			TaskBody::Repeated(body),
			false,
		)
	}

	pub(crate) fn fixed_rate(priority: Priority, run_at_ms: u64, period_ms: u64, body: Box<dyn FnMut() + Send>) -> Self {
		Self::new(
			priority,
			TaskKind::FixedRate {
				period_ms,
			},
			run_at_ms,
			TaskBody::Repeated(body),
			false,
		)
	}

	/// The graceful-shutdown marker: an ordinary immediate one-shot,
	/// except it survives queue drains uncounted and unreported.
	pub(crate) fn shutdown_marker(run_at_ms: u64, job: Job) -> Self {
		Self::new(Priority::High, TaskKind::Once, run_at_ms, TaskBody::Once(Some(job)), true)
	}

	fn new(priority: Priority, kind: TaskKind, run_at_ms: u64, body: TaskBody, shutdown_marker: bool) -> Self {
		Self {
			priority,
			kind,
			shutdown_marker,
			canceled: AtomicBool::new(false),
			executing: AtomicBool::new(false),
			next_run_ms: AtomicU64::new(run_at_ms),
			body: Mutex::new(body),
			observer: Mutex::new(None),
		}
	}

	pub(crate) fn priority(&self) -> Priority {
		self.priority
	}

	pub(crate) fn is_recurring(&self) -> bool {
		!matches!(self.kind, TaskKind::Once)
	}

	pub(crate) fn is_shutdown_marker(&self) -> bool {
		self.shutdown_marker
	}

	pub(crate) fn is_canceled(&self) -> bool {
		self.canceled.load(Ordering::Acquire)
	}

	pub(crate) fn is_executing(&self) -> bool {
		self.executing.load(Ordering::Acquire)
	}

	/// One-way cancel. Propagates into an attached future; does not
	/// interrupt a body that is already running.
	pub(crate) fn cancel(&self) {
		if self.canceled.swap(true, Ordering::AcqRel) {
			return;
		}
		if let Some(observer) = self.observer.lock().as_ref() {
			observer.canceled();
		}
	}

	pub(crate) fn set_observer(&self, observer: Arc<dyn CancelObserver>) {
		*self.observer.lock() = Some(observer);
	}

	/// How long this task has been past due at `now_ms`.
	pub(crate) fn queue_delay_ms(&self, now_ms: u64) -> u64 {
		now_ms.saturating_sub(self.next_run_ms.load(Ordering::Acquire))
	}

	/// Dequeue hook, run while the queue lock is held: a live recurring
	/// wrapper flips to executing and stays queued (at infinite delay),
	/// anything else leaves the queue.
	pub(crate) fn on_dequeue(&self) -> Dequeued {
		if self.is_recurring() && !self.is_canceled() {
			self.executing.store(true, Ordering::Release);
			Dequeued::Requeue
		} else {
			Dequeued::Consume
		}
	}

	/// Fixes the next due time after a completed run. Delay-style rests
	/// relative to completion; rate-style advances the previous due time,
	/// so long bodies do not accumulate drift.
	///
	/// Called inside the queue's reposition updater, under the queue lock.
	pub(crate) fn update_next_run_time(&self, completed_at_ms: u64) {
		match self.kind {
			TaskKind::Once => {}
			TaskKind::FixedDelay {
				rest_ms,
			} => {
				self.next_run_ms.store(completed_at_ms + rest_ms, Ordering::Release);
			}
			TaskKind::FixedRate {
				period_ms,
			} => {
				self.next_run_ms.fetch_add(period_ms, Ordering::AcqRel);
			}
		}
		self.executing.store(false, Ordering::Release);
	}

	/// Runs the user body, catching panics so a recurring task survives
	/// its own failures. Panics are forwarded to the uncaught-panic hook.
	pub(crate) fn execute_body(&self) {
		let mut body = self.body.lock();
		let outcome = match &mut *body {
			TaskBody::Once(job) => match job.take() {
				Some(job) => panic::catch_unwind(AssertUnwindSafe(job)),
				None => Ok(()),
			},
			TaskBody::Repeated(f) => panic::catch_unwind(AssertUnwindSafe(|| f())),
		};
		if let Err(payload) = outcome {
			report_uncaught_panic(payload);
		}
	}
}

impl Delayed for TaskWrapper {
	fn delay_ms(&self, now_ms: u64) -> i64 {
		if self.executing.load(Ordering::Acquire) {
			return i64::MAX;
		}
		self.next_run_ms.load(Ordering::Acquire) as i64 - now_ms as i64
	}
}

/// Identity of a queued task, returned at submission.
///
/// The handle is how a caller cancels a task or removes it from the queue;
/// it stays valid (but inert) after the task runs.
#[derive(Clone)]
pub struct TaskHandle {
	wrapper: Arc<TaskWrapper>,
}

impl TaskHandle {
	pub(crate) fn new(wrapper: Arc<TaskWrapper>) -> Self {
		Self {
			wrapper,
		}
	}

	/// Flags the task canceled. A queued task will not run; a body that
	/// already started is not interrupted, and a canceled recurring task
	/// stops rescheduling.
	pub fn cancel(&self) {
		self.wrapper.cancel();
	}

	pub fn is_canceled(&self) -> bool {
		self.wrapper.is_canceled()
	}

	pub fn priority(&self) -> Priority {
		self.wrapper.priority()
	}

	pub(crate) fn wrapper(&self) -> &Arc<TaskWrapper> {
		&self.wrapper
	}
}
