// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	collections::VecDeque,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
};

use parking_lot::{Condvar, Mutex};
use strand_core::ThreadFactory;
use tracing::debug;

use crate::{
	PoolConfig,
	worker::{Worker, WorkerHost},
};

/// How many idle workers must be on hand before worker contention is
/// considered over for the low-priority admission rule.
pub(crate) const WORKER_CONTENTION_LEVEL: usize = 2;

/// Slack granted to queued high-priority tasks before an older low-priority
/// task stops deferring to them.
pub(crate) const LOW_PRIORITY_WAIT_TOLERANCE_MS: i64 = 2;

/// The `workers_lock` domain: every field here is touched only while
/// [`WorkerPool::lock`] is held.
pub(crate) struct PoolState {
	pub(crate) core_pool_size: usize,
	pub(crate) max_pool_size: usize,
	pub(crate) keep_alive_ms: u64,
	pub(crate) allow_core_thread_timeout: bool,
	/// Total live workers, idle or assigned.
	pub(crate) current_pool_size: usize,
	/// Idle workers. Newest pushed to the front, expiry candidates
	/// examined from the back, so the hottest workers keep working.
	pub(crate) available_workers: VecDeque<Arc<Worker>>,
	/// Consumers blocked awaiting a worker.
	pub(crate) waiting_for_worker_count: usize,
	/// Most recent queueing delay of a high-priority task that had to
	/// wait; consulted by the low-priority admission rule.
	pub(crate) last_high_delay_ms: u64,
}

pub(crate) struct WorkerPool {
	pub(crate) lock: Mutex<PoolState>,
	pub(crate) worker_available: Condvar,
	worker_seq: AtomicU64,
}

impl WorkerPool {
	pub(crate) fn new(config: &PoolConfig) -> Self {
		Self {
			lock: Mutex::new(PoolState {
				core_pool_size: config.core_pool_size,
				max_pool_size: config.max_pool_size,
				keep_alive_ms: config.keep_alive.as_millis() as u64,
				allow_core_thread_timeout: config.allow_core_thread_timeout,
				current_pool_size: 0,
				available_workers: VecDeque::new(),
				waiting_for_worker_count: 0,
				last_high_delay_ms: 0,
			}),
			worker_available: Condvar::new(),
			worker_seq: AtomicU64::new(0),
		}
	}

	/// Creates, registers, and starts a worker. Runs under the pool lock;
	/// the caller still owns the returned worker (it is not pushed to the
	/// idle deque) and may hand it a task directly.
	pub(crate) fn make_new_worker(
		&self,
		state: &mut PoolState,
		factory: &Arc<dyn ThreadFactory>,
		host: Arc<dyn WorkerHost>,
		now_ms: u64,
	) -> Arc<Worker> {
		let id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
		let worker = Worker::new(now_ms);
		state.current_pool_size += 1;
		debug!(worker = id, pool_size = state.current_pool_size, "starting worker");
		let thread_worker = Arc::clone(&worker);
		factory.spawn(format!("strand-worker-{id}"), Box::new(move || thread_worker.run_loop(host)))
			.expect("failed to spawn worker thread");
		worker
	}

	/// Expires idle workers from the back of the deque: unconditionally
	/// while the pool exceeds `max_pool_size` (it may have been lowered),
	/// and by `keep_alive` idle time while the pool exceeds core size (or
	/// core timeout is allowed).
	pub(crate) fn expire_old_workers(&self, state: &mut PoolState, now_ms: u64) {
		loop {
			let expire = match state.available_workers.back() {
				None => false,
				Some(oldest) => {
					state.current_pool_size > state.max_pool_size
						|| ((state.current_pool_size > state.core_pool_size
							|| state.allow_core_thread_timeout)
							&& now_ms.saturating_sub(oldest.idle_since_ms())
								>= state.keep_alive_ms)
				}
			};
			if !expire {
				return;
			}
			if let Some(worker) = state.available_workers.pop_back() {
				state.current_pool_size -= 1;
				worker.kill();
				debug!(pool_size = state.current_pool_size, "expired idle worker");
			}
		}
	}
}
