// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{hash::Hash, time::Duration};

use strand_core::{Executor, Job};
use strand_pool::TaskHandle;
use tracing::debug;

use crate::KeyDistributor;

/// A per-key view over a [`KeyDistributor`]: every operation is pre-bound
/// to one key, giving callers a plain serialized scheduler.
pub struct KeyScheduler<K> {
	distributor: KeyDistributor<K>,
	key: K,
}

impl<K: Hash + Eq + Clone + Send + Sync + 'static> KeyScheduler<K> {
	pub(crate) fn new(distributor: KeyDistributor<K>, key: K) -> Self {
		Self {
			distributor,
			key,
		}
	}

	pub fn key(&self) -> &K {
		&self.key
	}

	pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> strand_core::Result<()> {
		self.distributor.execute(self.key.clone(), task)
	}

	pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> strand_core::Result<TaskHandle> {
		self.distributor.schedule(self.key.clone(), delay, task)
	}

	pub fn schedule_with_fixed_delay(
		&self,
		initial_delay: Duration,
		rest: Duration,
		task: impl FnMut() + Send + 'static,
	) -> strand_core::Result<TaskHandle> {
		self.distributor.schedule_with_fixed_delay(self.key.clone(), initial_delay, rest, task)
	}

	/// Reflects the underlying scheduler's state.
	pub fn is_shutdown(&self) -> bool {
		self.distributor.is_shutdown()
	}
}

impl<K: Hash + Eq + Clone + Send + Sync + 'static> Executor for KeyScheduler<K> {
	fn execute_job(&self, job: Job) {
		if let Err(err) = self.distributor.submit_job(self.key.clone(), job) {
			debug!("dropping job handed to a shut-down key scheduler: {err}");
		}
	}
}
