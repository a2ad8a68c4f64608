// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

pub use clock::Clock;
pub use delay_queue::{Delayed, DelayQueue, Dequeued};
pub use error::Error;
pub use executor::{Executor, Job};
pub use future::{ListenerId, TaskFailure, TaskFuture, TaskOutcome};
pub use hook::{panic_message, report_uncaught_panic, set_uncaught_panic_hook};
pub use thread_factory::{DefaultThreadFactory, ThreadFactory};

mod clock;
mod delay_queue;
mod error;
mod executor;
mod future;
mod hook;
mod thread_factory;

pub type Result<T> = std::result::Result<T, Error>;
