// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{io, thread};

use crate::Job;

/// Mints the OS threads backing workers and queue consumers.
///
/// The pool calls this whenever a new thread is needed; swap in a custom
/// factory to control naming, priority, or instrumentation of pool threads.
pub trait ThreadFactory: Send + Sync {
	fn spawn(&self, name: String, f: Job) -> io::Result<()>;
}

/// Spawns detached threads under the name the pool hands in.
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
	fn spawn(&self, name: String, f: Job) -> io::Result<()> {
		thread::Builder::new().name(name).spawn(f)?;
		Ok(())
	}
}
