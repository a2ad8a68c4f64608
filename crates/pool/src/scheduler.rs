// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	panic::{self, AssertUnwindSafe},
	sync::{
		Arc, Weak,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use parking_lot::Mutex;
use strand_core::{
	Clock, Error, Executor, Job, TaskFailure, TaskFuture, ThreadFactory, panic_message, report_uncaught_panic,
};
use tracing::{debug, error, info, instrument};

use crate::{
	PoolConfig, Priority, TaskHandle,
	consumer::TaskQueue,
	pool::{LOW_PRIORITY_WAIT_TOLERANCE_MS, WORKER_CONTENTION_LEVEL, WorkerPool},
	task::TaskWrapper,
	worker::{Worker, WorkerHost},
};

/// An elastic worker pool scheduling one-shot and recurring tasks across
/// two priority lanes.
///
/// The pool grows on demand from `core_pool_size` up to `max_pool_size`;
/// workers above core retire after sitting idle for the configured
/// keep-alive. High-priority tasks win contended workers outright.
/// Low-priority tasks briefly defer to older queued high-priority work and
/// prefer reusing a warm worker over growing the pool, waiting up to
/// `max_wait_for_low_priority` before spawning on their own behalf.
///
/// Cloning is cheap and hands out another handle to the same pool.
pub struct PriorityScheduler {
	core: Arc<SchedulerCore>,
}

impl Clone for PriorityScheduler {
	fn clone(&self) -> Self {
		Self {
			core: Arc::clone(&self.core),
		}
	}
}

impl PriorityScheduler {
	pub fn new(config: PoolConfig) -> strand_core::Result<Self> {
		config.validate()?;
		let clock = Arc::new(Clock::new());
		let core = Arc::new_cyclic(|self_ref| SchedulerCore {
			high: TaskQueue::new(Priority::High, Arc::clone(&clock)),
			low: TaskQueue::new(Priority::Low, Arc::clone(&clock)),
			pool: WorkerPool::new(&config),
			pool_size_change: Mutex::new(()),
			thread_factory: Arc::clone(&config.thread_factory),
			default_priority: config.default_priority,
			max_wait_for_low_priority_ms: config.max_wait_for_low_priority.as_millis() as u64,
			shutdown_started: AtomicBool::new(false),
			shutdown_finishing: AtomicBool::new(false),
			clock,
			self_ref: self_ref.clone(),
		});
		Ok(Self {
			core,
		})
	}

	/// Runs `task` as soon as a worker is available, at the configured
	/// default priority.
	pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> strand_core::Result<()> {
		self.execute_with_priority(self.core.default_priority, task)
	}

	pub fn execute_with_priority(
		&self,
		priority: Priority,
		task: impl FnOnce() + Send + 'static,
	) -> strand_core::Result<()> {
		self.enqueue_once(priority, Duration::ZERO, Box::new(task)).map(|_| ())
	}

	/// Runs `task` once `delay` elapses.
	#[instrument(level = "trace", skip(self, task))]
	pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> strand_core::Result<TaskHandle> {
		self.schedule_with_priority(self.core.default_priority, delay, task)
	}

	pub fn schedule_with_priority(
		&self,
		priority: Priority,
		delay: Duration,
		task: impl FnOnce() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		self.enqueue_once(priority, delay, Box::new(task))
	}

	/// Runs `task` after `initial_delay`, then again each time `rest`
	/// elapses after a completed run.
	#[instrument(level = "trace", skip(self, task))]
	pub fn schedule_with_fixed_delay(
		&self,
		initial_delay: Duration,
		rest: Duration,
		task: impl FnMut() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		self.schedule_with_fixed_delay_and_priority(self.core.default_priority, initial_delay, rest, task)
	}

	pub fn schedule_with_fixed_delay_and_priority(
		&self,
		priority: Priority,
		initial_delay: Duration,
		rest: Duration,
		task: impl FnMut() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		let run_at = self.core.due_at(initial_delay)?;
		let rest_ms = rest.as_millis() as u64;
		let wrapper = Arc::new(TaskWrapper::fixed_delay(priority, run_at, rest_ms, Box::new(task)));
		self.core.enqueue(Arc::clone(&wrapper));
		Ok(TaskHandle::new(wrapper))
	}

	/// Runs `task` after `initial_delay`, then on a drift-free schedule
	/// every `period`.
	#[instrument(level = "trace", skip(self, task))]
	pub fn schedule_at_fixed_rate(
		&self,
		initial_delay: Duration,
		period: Duration,
		task: impl FnMut() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		self.schedule_at_fixed_rate_and_priority(self.core.default_priority, initial_delay, period, task)
	}

	pub fn schedule_at_fixed_rate_and_priority(
		&self,
		priority: Priority,
		initial_delay: Duration,
		period: Duration,
		task: impl FnMut() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		if period.is_zero() {
			return Err(Error::InvalidConfig("fixed-rate period must be positive".into()));
		}
		let run_at = self.core.due_at(initial_delay)?;
		let period_ms = period.as_millis() as u64;
		let wrapper = Arc::new(TaskWrapper::fixed_rate(priority, run_at, period_ms, Box::new(task)));
		self.core.enqueue(Arc::clone(&wrapper));
		Ok(TaskHandle::new(wrapper))
	}

	/// Runs `task` as soon as possible; the returned future resolves with
	/// the task's value once the body returns, or with the failure if it
	/// panics or is canceled first.
	pub fn submit<T, F>(&self, task: F) -> strand_core::Result<TaskFuture<T>>
	where
		T: Send + 'static,
		F: FnOnce() -> T + Send + 'static,
	{
		self.submit_scheduled_with_priority(self.core.default_priority, Duration::ZERO, task)
	}

	pub fn submit_with_priority<T, F>(&self, priority: Priority, task: F) -> strand_core::Result<TaskFuture<T>>
	where
		T: Send + 'static,
		F: FnOnce() -> T + Send + 'static,
	{
		self.submit_scheduled_with_priority(priority, Duration::ZERO, task)
	}

	pub fn submit_scheduled<T, F>(&self, delay: Duration, task: F) -> strand_core::Result<TaskFuture<T>>
	where
		T: Send + 'static,
		F: FnOnce() -> T + Send + 'static,
	{
		self.submit_scheduled_with_priority(self.core.default_priority, delay, task)
	}

	pub fn submit_scheduled_with_priority<T, F>(
		&self,
		priority: Priority,
		delay: Duration,
		task: F,
	) -> strand_core::Result<TaskFuture<T>>
	where
		T: Send + 'static,
		F: FnOnce() -> T + Send + 'static,
	{
		let future = TaskFuture::new(true);
		let completer = future.clone();
		let job: Job = Box::new(move || match panic::catch_unwind(AssertUnwindSafe(task)) {
			Ok(value) => {
				completer.complete(Ok(value));
			}
			Err(payload) => {
				completer.complete(Err(TaskFailure::Panicked(panic_message(payload.as_ref()))));
				report_uncaught_panic(payload);
			}
		});
		let handle = self.enqueue_once(priority, delay, job)?;
		handle.wrapper().set_observer(Arc::new(future.clone()));
		let wrapper = Arc::downgrade(handle.wrapper());
		future.set_cancel_hook(move || {
			if let Some(wrapper) = wrapper.upgrade() {
				wrapper.cancel();
			}
		});
		Ok(future)
	}

	/// Cancels and removes a not-yet-started task from whichever queue
	/// holds it. Returns whether anything was removed.
	pub fn remove(&self, handle: &TaskHandle) -> bool {
		let target = handle.wrapper();
		for queue in [&self.core.high, &self.core.low] {
			if let Some(found) = queue.delay.remove_first(|queued| Arc::ptr_eq(queued, target)) {
				found.cancel();
				return true;
			}
		}
		false
	}

	/// Graceful shutdown: already-queued tasks drain, new submissions are
	/// rejected. Safe to call more than once.
	#[instrument(level = "trace", skip(self))]
	pub fn shutdown(&self) {
		if self.core.shutdown_started.swap(true, Ordering::AcqRel) {
			return;
		}
		info!("scheduler shutting down, draining queued tasks");
		let core = Arc::clone(&self.core);
		let marker: Job = Box::new(move || {
			core.shutdown_now_impl();
		});
		let wrapper = Arc::new(TaskWrapper::shutdown_marker(self.core.clock.accurate_millis(), marker));
		self.core.enqueue(wrapper);
	}

	/// Immediate shutdown: queued tasks are canceled and their handles
	/// returned, idle workers are stopped, running tasks finish normally.
	#[instrument(level = "trace", skip(self))]
	pub fn shutdown_now(&self) -> Vec<TaskHandle> {
		self.core.shutdown_now_impl()
	}

	pub fn is_shutdown(&self) -> bool {
		self.core.shutdown_started.load(Ordering::Acquire)
	}

	/// Total live workers, idle or assigned.
	pub fn current_pool_size(&self) -> usize {
		self.core.pool.lock.lock().current_pool_size
	}

	/// Tasks currently queued (due or delayed) at `priority`.
	pub fn queued_task_count(&self, priority: Priority) -> usize {
		self.core.queue(priority).delay.len()
	}

	pub fn default_priority(&self) -> Priority {
		self.core.default_priority
	}

	/// Eagerly starts idle workers up to the core pool size.
	pub fn prestart_core_workers(&self) {
		let mut state = self.core.pool.lock.lock();
		let now = self.core.clock.accurate_millis();
		while state.current_pool_size < state.core_pool_size {
			let worker =
				self.core.pool.make_new_worker(&mut state, &self.core.thread_factory, self.core.host(), now);
			worker.mark_idle(now);
			state.available_workers.push_front(worker);
		}
	}

	/// Adjusts the retained pool size. Fails if `size` is zero or above
	/// the current max. A decrease lets excess idle workers expire.
	pub fn set_core_pool_size(&self, size: usize) -> strand_core::Result<()> {
		let _resize = self.core.pool_size_change.lock();
		let mut state = self.core.pool.lock.lock();
		if size == 0 {
			return Err(Error::InvalidConfig("core_pool_size must be at least 1".into()));
		}
		if size > state.max_pool_size {
			return Err(Error::InvalidConfig(format!(
				"core_pool_size {size} exceeds max_pool_size {}",
				state.max_pool_size
			)));
		}
		let before = state.core_pool_size;
		state.core_pool_size = size;
		if size < before {
			self.core.pool.expire_old_workers(&mut state, self.core.clock.accurate_millis());
		}
		Ok(())
	}

	/// Adjusts the growth bound. Fails if `size` is below the core size.
	/// An increase starts workers for consumers already blocked waiting
	/// (never more than are actually waiting); a decrease retires excess
	/// workers as they go idle, never interrupting running tasks.
	pub fn set_max_pool_size(&self, size: usize) -> strand_core::Result<()> {
		let _resize = self.core.pool_size_change.lock();
		let mut state = self.core.pool.lock.lock();
		if size < state.core_pool_size {
			return Err(Error::InvalidConfig(format!(
				"max_pool_size {size} is below core_pool_size {}",
				state.core_pool_size
			)));
		}
		let grew = size > state.max_pool_size;
		state.max_pool_size = size;
		let now = self.core.clock.accurate_millis();
		if grew {
			let headroom = size.saturating_sub(state.current_pool_size);
			let mut spawn = state.waiting_for_worker_count.min(headroom);
			while spawn > 0 {
				let worker = self.core.pool.make_new_worker(
					&mut state,
					&self.core.thread_factory,
					self.core.host(),
					now,
				);
				worker.mark_idle(now);
				state.available_workers.push_front(worker);
				spawn -= 1;
			}
		} else {
			self.core.pool.expire_old_workers(&mut state, now);
		}
		self.core.pool.worker_available.notify_all();
		Ok(())
	}

	/// When set, core workers also expire after `keep_alive` idle time.
	pub fn set_allow_core_thread_timeout(&self, allow: bool) {
		let _resize = self.core.pool_size_change.lock();
		let mut state = self.core.pool.lock.lock();
		state.allow_core_thread_timeout = allow;
		if allow {
			self.core.pool.expire_old_workers(&mut state, self.core.clock.accurate_millis());
		}
	}

	fn enqueue_once(&self, priority: Priority, delay: Duration, job: Job) -> strand_core::Result<TaskHandle> {
		let run_at = self.core.due_at(delay)?;
		let wrapper = Arc::new(TaskWrapper::once(priority, run_at, job));
		self.core.enqueue(Arc::clone(&wrapper));
		Ok(TaskHandle::new(wrapper))
	}
}

impl Executor for PriorityScheduler {
	fn execute_job(&self, job: Job) {
		if let Err(err) = self.enqueue_once(self.core.default_priority, Duration::ZERO, job) {
			debug!("dropping job handed to a shut-down scheduler: {err}");
		}
	}
}

pub(crate) struct SchedulerCore {
	pub(crate) high: TaskQueue,
	pub(crate) low: TaskQueue,
	pub(crate) pool: WorkerPool,
	pool_size_change: Mutex<()>,
	thread_factory: Arc<dyn ThreadFactory>,
	default_priority: Priority,
	max_wait_for_low_priority_ms: u64,
	shutdown_started: AtomicBool,
	shutdown_finishing: AtomicBool,
	pub(crate) clock: Arc<Clock>,
	self_ref: Weak<SchedulerCore>,
}

impl SchedulerCore {
	pub(crate) fn queue(&self, priority: Priority) -> &TaskQueue {
		match priority {
			Priority::High => &self.high,
			Priority::Low => &self.low,
		}
	}

	pub(crate) fn thread_factory(&self) -> &Arc<dyn ThreadFactory> {
		&self.thread_factory
	}

	fn arc(&self) -> Arc<SchedulerCore> {
		self.self_ref.upgrade().expect("scheduler core outlived by its own machinery")
	}

	fn host(&self) -> Arc<dyn WorkerHost> {
		self.arc()
	}

	fn is_shutdown_finishing(&self) -> bool {
		self.shutdown_finishing.load(Ordering::Acquire)
	}

	fn due_at(&self, delay: Duration) -> strand_core::Result<u64> {
		if self.shutdown_started.load(Ordering::Acquire) {
			return Err(Error::Rejected);
		}
		Ok(self.clock.accurate_millis() + delay.as_millis() as u64)
	}

	pub(crate) fn enqueue(&self, wrapper: Arc<TaskWrapper>) {
		let queue = self.queue(wrapper.priority());
		queue.delay.add(wrapper);
		queue.ensure_consumer(&self.arc());
	}

	/// High-priority dispatch: reuse an idle worker, grow the pool while
	/// below max, otherwise record this task's queueing delay and wait for
	/// a worker as long as it takes.
	pub(crate) fn run_high_priority_task(&self, wrapper: Arc<TaskWrapper>) {
		let mut state = self.pool.lock.lock();
		let worker = loop {
			if self.is_shutdown_finishing() {
				return;
			}
			if let Some(worker) = state.available_workers.pop_front() {
				break worker;
			}
			if state.current_pool_size < state.max_pool_size {
				break self.pool.make_new_worker(
					&mut state,
					&self.thread_factory,
					self.host(),
					self.clock.accurate_millis(),
				);
			}
			state.last_high_delay_ms = wrapper.queue_delay_ms(self.clock.accurate_millis());
			state.waiting_for_worker_count += 1;
			self.pool.worker_available.wait(&mut state);
			state.waiting_for_worker_count -= 1;
		};
		drop(state);
		worker.next_task(wrapper);
	}

	/// Low-priority dispatch. Defers to older queued high-priority work
	/// while workers are contended, re-checking after every wake, and
	/// acquires a worker with a bias toward reusing a warm one over
	/// growing the pool.
	pub(crate) fn run_low_priority_task(&self, wrapper: Arc<TaskWrapper>) {
		let mut state = self.pool.lock.lock();
		let worker = loop {
			if self.is_shutdown_finishing() {
				return;
			}
			// Fair precedence to due high-priority tasks that have been
			// waiting longer than the tolerance allows for. Backlog is a
			// due queued task or the high consumer already blocked in
			// dispatch; a queue holding only not-yet-due recurring tasks
			// does not count, or lows could starve against it.
			let now = self.clock.accurate_millis();
			let high_backlog = self.high.has_due_task(now) || state.waiting_for_worker_count > 0;
			if state.current_pool_size >= state.max_pool_size
				&& state.available_workers.len() < WORKER_CONTENTION_LEVEL
				&& high_backlog
			{
				let behind = wrapper.queue_delay_ms(now) as i64 - state.last_high_delay_ms as i64;
				if behind > LOW_PRIORITY_WAIT_TOLERANCE_MS {
					self.pool
						.worker_available
						.wait_for(&mut state, Duration::from_millis(behind as u64));
					continue;
				}
			}
			if !high_backlog {
				state.last_high_delay_ms = 0;
			}
			if let Some(worker) = state.available_workers.pop_front() {
				break worker;
			}
			if state.current_pool_size == 0 {
				// Nothing to reuse and nothing running that could free
				// up: grow rather than block forever.
				break self.pool.make_new_worker(
					&mut state,
					&self.thread_factory,
					self.host(),
					self.clock.accurate_millis(),
				);
			}
			if state.current_pool_size >= state.max_pool_size {
				state.waiting_for_worker_count += 1;
				self.pool.worker_available.wait(&mut state);
				state.waiting_for_worker_count -= 1;
				continue;
			}
			state.waiting_for_worker_count += 1;
			let timed_out = self
				.pool
				.worker_available
				.wait_for(&mut state, Duration::from_millis(self.max_wait_for_low_priority_ms))
				.timed_out();
			state.waiting_for_worker_count -= 1;
			if timed_out && state.current_pool_size < state.max_pool_size {
				break self.pool.make_new_worker(
					&mut state,
					&self.thread_factory,
					self.host(),
					self.clock.accurate_millis(),
				);
			}
		};
		drop(state);
		worker.next_task(wrapper);
	}

	/// Fixes a completed recurring wrapper's next due time and re-sorts it
	/// in its queue. Skipped silently once shutdown started; a missing
	/// wrapper is tolerated only when it was canceled.
	fn reschedule(&self, wrapper: &Arc<TaskWrapper>) {
		if self.shutdown_started.load(Ordering::Acquire) {
			return;
		}
		let completed_at = self.clock.accurate_millis();
		let queue = self.queue(wrapper.priority());
		match queue.delay.reposition(wrapper, || wrapper.update_next_run_time(completed_at)) {
			Ok(()) => {}
			Err(_) if wrapper.is_canceled() => {}
			Err(err) => {
				error!("recurring task missing from its queue at reschedule: {err}");
			}
		}
	}

	pub(crate) fn shutdown_now_impl(&self) -> Vec<TaskHandle> {
		self.shutdown_started.store(true, Ordering::Release);
		self.shutdown_finishing.store(true, Ordering::Release);
		self.high.delay.close();
		self.low.delay.close();
		let mut pending = self.high.delay.drain();
		pending.extend(self.low.delay.drain());
		pending.retain(|wrapper| !wrapper.is_shutdown_marker() && !wrapper.is_executing());
		for wrapper in &pending {
			wrapper.cancel();
		}
		{
			let mut state = self.pool.lock.lock();
			while let Some(worker) = state.available_workers.pop_back() {
				state.current_pool_size -= 1;
				worker.kill();
			}
		}
		self.pool.worker_available.notify_all();
		info!(dropped = pending.len(), "scheduler shut down");
		pending.into_iter().map(TaskHandle::new).collect()
	}
}

impl WorkerHost for SchedulerCore {
	fn run_wrapper(&self, wrapper: &Arc<TaskWrapper>) {
		if wrapper.is_canceled() {
			return;
		}
		wrapper.execute_body();
		if !wrapper.is_recurring() {
			return;
		}
		if wrapper.is_canceled() {
			// Canceled mid-run: the executing placeholder must not
			// linger in the queue.
			let _ = self.queue(wrapper.priority()).delay.remove_first(|queued| Arc::ptr_eq(queued, wrapper));
			return;
		}
		self.reschedule(wrapper);
	}

	fn worker_done(&self, worker: &Arc<Worker>) -> bool {
		let mut state = self.pool.lock.lock();
		if self.is_shutdown_finishing() {
			state.current_pool_size -= 1;
			return false;
		}
		let now = self.clock.accurate_millis();
		worker.mark_idle(now);
		state.available_workers.push_front(Arc::clone(worker));
		self.pool.expire_old_workers(&mut state, now);
		if worker.is_stopped() {
			return false;
		}
		self.pool.worker_available.notify_all();
		true
	}
}
