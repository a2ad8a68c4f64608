// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

/// A unit of work accepted by the execution surface.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Anything able to run a job, now or later.
///
/// Implemented by the scheduler and by per-key façades; also the seam
/// through which completion listeners can be delivered on a thread other
/// than the completing one.
pub trait Executor: Send + Sync {
	fn execute_job(&self, job: Job);
}
