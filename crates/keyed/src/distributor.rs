// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	collections::{HashMap, VecDeque},
	hash::{DefaultHasher, Hash, Hasher},
	panic::{self, AssertUnwindSafe},
	sync::Arc,
	time::Duration,
};

use parking_lot::Mutex;
use strand_core::{Error, Job, report_uncaught_panic};
use strand_pool::{PriorityScheduler, TaskHandle};
use tracing::debug;

use crate::KeyScheduler;

const DEFAULT_STRIPES: usize = 16;

/// Serializes tasks sharing a key on top of a [`PriorityScheduler`].
///
/// Tasks enqueued against the same key run sequentially, in submission
/// order, and on a single worker thread while the key's chain is active,
/// without pinning a thread per key. An active key occupies exactly one
/// pool task that drains the key's queue; distinct keys run concurrently,
/// subject to the pool.
///
/// Per-key metadata is guarded by one of a fixed set of stripe locks chosen
/// by hashing the key. With a single stripe the distributor degenerates to
/// a global serial scheduler for all keys.
///
/// Cloning hands out another handle to the same distributor.
pub struct KeyDistributor<K> {
	inner: Arc<Inner<K>>,
}

impl<K> Clone for KeyDistributor<K> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

pub(crate) struct Inner<K> {
	scheduler: PriorityScheduler,
	stripes: Box<[Stripe<K>]>,
}

struct Stripe<K> {
	queues: Mutex<HashMap<K, KeyQueue>>,
}

#[derive(Default)]
struct KeyQueue {
	/// Whether a drain task is currently dispatched for this key.
	running: bool,
	jobs: VecDeque<Job>,
}

impl<K: Hash + Eq + Clone + Send + Sync + 'static> KeyDistributor<K> {
	/// A distributor with the default stripe count.
	pub fn new(scheduler: PriorityScheduler) -> Self {
		Self::with_stripes(scheduler, DEFAULT_STRIPES).expect("default stripe count is valid")
	}

	/// A distributor with `stripes` stripe locks; fixed for the lifetime
	/// of the distributor. Fails on a zero stripe count.
	pub fn with_stripes(scheduler: PriorityScheduler, stripes: usize) -> strand_core::Result<Self> {
		if stripes == 0 {
			return Err(Error::InvalidConfig("stripe count must be at least 1".into()));
		}
		let stripes = (0..stripes)
			.map(|_| Stripe {
				queues: Mutex::new(HashMap::new()),
			})
			.collect::<Vec<_>>()
			.into_boxed_slice();
		Ok(Self {
			inner: Arc::new(Inner {
				scheduler,
				stripes,
			}),
		})
	}

	/// Appends `task` to the key's chain; it runs after everything
	/// already enqueued for that key.
	pub fn execute(&self, key: K, task: impl FnOnce() + Send + 'static) -> strand_core::Result<()> {
		self.submit_job(key, Box::new(task))
	}

	/// Enqueues `task` onto the key's chain once `delay` elapses. The
	/// delay gates the enqueue, not the execution: after it fires the
	/// task still waits its turn behind the chain.
	pub fn schedule(
		&self,
		key: K,
		delay: Duration,
		task: impl FnOnce() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		let distributor = self.clone();
		self.inner.scheduler.schedule(delay, move || {
			if let Err(err) = distributor.submit_job(key, Box::new(task)) {
				debug!("dropping delayed keyed task: {err}");
			}
		})
	}

	/// Repeatedly enqueues `task` onto the key's chain: once after
	/// `initial_delay`, then again each time `rest` elapses after the
	/// previous enqueue fired.
	pub fn schedule_with_fixed_delay(
		&self,
		key: K,
		initial_delay: Duration,
		rest: Duration,
		task: impl FnMut() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		let distributor = self.clone();
		let task = Arc::new(Mutex::new(task));
		self.inner.scheduler.schedule_with_fixed_delay(initial_delay, rest, move || {
			let task = Arc::clone(&task);
			let job: Job = Box::new(move || (&mut *task.lock())());
			if let Err(err) = distributor.submit_job(key.clone(), job) {
				debug!("dropping recurring keyed task: {err}");
			}
		})
	}

	/// Tasks waiting in the key's chain, not counting one mid-run.
	pub fn queued_task_count(&self, key: &K) -> usize {
		let stripe = self.inner.stripe(key);
		let queues = stripe.queues.lock();
		queues.get(key).map_or(0, |entry| entry.jobs.len())
	}

	/// A façade pre-binding `key` over this distributor.
	pub fn scheduler_for_key(&self, key: K) -> KeyScheduler<K> {
		KeyScheduler::new(self.clone(), key)
	}

	/// Reflects the underlying scheduler's state.
	pub fn is_shutdown(&self) -> bool {
		self.inner.scheduler.is_shutdown()
	}

	pub fn scheduler(&self) -> &PriorityScheduler {
		&self.inner.scheduler
	}

	pub(crate) fn submit_job(&self, key: K, job: Job) -> strand_core::Result<()> {
		if self.inner.scheduler.is_shutdown() {
			return Err(Error::Rejected);
		}
		let stripe = self.inner.stripe(&key);
		let mut queues = stripe.queues.lock();
		let entry = queues.entry(key.clone()).or_default();
		entry.jobs.push_back(job);
		if !entry.running {
			entry.running = true;
			let inner = Arc::clone(&self.inner);
			let drain_key = key.clone();
			if let Err(err) = self.inner.scheduler.execute(move || Inner::drain(&inner, &drain_key)) {
				entry.jobs.pop_back();
				entry.running = false;
				if entry.jobs.is_empty() {
					queues.remove(&key);
				}
				return Err(err);
			}
		}
		Ok(())
	}
}

impl<K: Hash + Eq + Clone + Send + Sync + 'static> Inner<K> {
	fn stripe(&self, key: &K) -> &Stripe<K> {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		let index = (hasher.finish() as usize) % self.stripes.len();
		&self.stripes[index]
	}

	/// The single pool task a key's chain occupies while active: pick the
	/// next job under the stripe lock, run it outside the lock, repeat
	/// until the chain drains, then clear the running mark and drop the
	/// entry. A panicking job is reported and does not break the chain.
	fn drain(inner: &Arc<Inner<K>>, key: &K) {
		let stripe = inner.stripe(key);
		loop {
			let job = {
				let mut queues = stripe.queues.lock();
				let Some(entry) = queues.get_mut(key) else {
					return;
				};
				match entry.jobs.pop_front() {
					Some(job) => job,
					None => {
						entry.running = false;
						if entry.jobs.is_empty() {
							queues.remove(key);
						}
						return;
					}
				}
			};
			if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
				report_uncaught_panic(payload);
			}
		}
	}
}
