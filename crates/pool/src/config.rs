// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{sync::Arc, time::Duration};

use strand_core::{DefaultThreadFactory, Error, ThreadFactory};

use crate::Priority;

/// Configuration for a [`PriorityScheduler`](crate::PriorityScheduler).
///
/// `core_pool_size` workers are retained forever once created; under demand
/// the pool grows up to `max_pool_size`, and workers above core expire after
/// sitting idle for `keep_alive` (or any idle worker, when
/// `allow_core_thread_timeout` is set).
#[derive(Clone)]
pub struct PoolConfig {
	/// Workers retained even when idle. Must be at least 1.
	pub core_pool_size: usize,
	/// Upper bound on pool growth. Must be at least `core_pool_size`.
	pub max_pool_size: usize,
	/// Idle time after which a worker above core size is expired.
	pub keep_alive: Duration,
	/// Priority used by submissions that do not specify one.
	pub default_priority: Priority,
	/// How long a low-priority task waits for a warm worker before the
	/// pool grows on its behalf.
	pub max_wait_for_low_priority: Duration,
	/// When set, core workers are also subject to `keep_alive` expiry.
	pub allow_core_thread_timeout: bool,
	/// Mints the OS threads backing workers and queue consumers.
	pub thread_factory: Arc<dyn ThreadFactory>,
}

impl PoolConfig {
	/// A pool pinned to `size` workers for both core and max.
	pub fn fixed(size: usize) -> Self {
		Self {
			core_pool_size: size,
			max_pool_size: size,
			..Self::default()
		}
	}

	pub(crate) fn validate(&self) -> strand_core::Result<()> {
		if self.core_pool_size == 0 {
			return Err(Error::InvalidConfig("core_pool_size must be at least 1".into()));
		}
		if self.max_pool_size < self.core_pool_size {
			return Err(Error::InvalidConfig(format!(
				"max_pool_size {} is below core_pool_size {}",
				self.max_pool_size, self.core_pool_size
			)));
		}
		Ok(())
	}
}

impl Default for PoolConfig {
	fn default() -> Self {
		let cores = num_cpus::get().max(1);
		Self {
			core_pool_size: cores,
			max_pool_size: cores * 2,
			keep_alive: Duration::from_secs(60),
			default_priority: Priority::High,
			max_wait_for_low_priority: Duration::from_millis(500),
			allow_core_thread_timeout: false,
			thread_factory: Arc::new(DefaultThreadFactory),
		}
	}
}
