// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};

use strand_core::{Clock, DelayQueue, Delayed};

use crate::{
	Priority,
	scheduler::SchedulerCore,
	task::TaskWrapper,
};

/// One scheduling lane: a delay-ordered queue plus its single consumer
/// thread. The consumer starts lazily on the first enqueue and stops for
/// good when the queue closes.
pub(crate) struct TaskQueue {
	pub(crate) priority: Priority,
	pub(crate) delay: DelayQueue<TaskWrapper>,
	consumer_started: AtomicBool,
}

impl TaskQueue {
	pub(crate) fn new(priority: Priority, clock: Arc<Clock>) -> Self {
		Self {
			priority,
			delay: DelayQueue::new(clock),
			consumer_started: AtomicBool::new(false),
		}
	}

	/// Whether the nearest-due queued task is already due at `now_ms`.
	pub(crate) fn has_due_task(&self, now_ms: u64) -> bool {
		self.delay.scan(|items| items.first().is_some_and(|wrapper| wrapper.delay_ms(now_ms) <= 0))
	}

	pub(crate) fn ensure_consumer(&self, core: &Arc<SchedulerCore>) {
		if self.consumer_started.load(Ordering::Acquire) {
			return;
		}
		if self.consumer_started.swap(true, Ordering::AcqRel) {
			return;
		}
		let label = match self.priority {
			Priority::High => "high",
			Priority::Low => "low",
		};
		let priority = self.priority;
		let consumer_core = Arc::clone(core);
		core.thread_factory()
			.spawn(format!("strand-consumer-{label}"), Box::new(move || consume_loop(consumer_core, priority)))
			.expect("failed to spawn queue consumer thread");
	}
}

/// Pops due wrappers and feeds them to the pool's dispatch policy. The
/// on-dequeue hook runs under the queue lock, so a recurring wrapper is
/// already re-appended (executing, infinite delay) by the time dispatch
/// sees it.
fn consume_loop(core: Arc<SchedulerCore>, priority: Priority) {
	let queue = core.queue(priority);
	while let Some(wrapper) = queue.delay.take(|wrapper| wrapper.on_dequeue()) {
		if wrapper.is_canceled() {
			continue;
		}
		match priority {
			Priority::High => core.run_high_priority_task(wrapper),
			Priority::Low => core.run_low_priority_task(wrapper),
		}
	}
}
