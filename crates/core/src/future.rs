// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	panic::{self, AssertUnwindSafe},
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{Executor, Job};

/// Why a submitted task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskFailure {
	/// The task body panicked; carries the rendered panic message.
	#[error("task panicked: {0}")]
	Panicked(String),

	/// The task was canceled before it ran.
	#[error("task canceled")]
	Canceled,
}

/// What a submitted task resolved to.
pub type TaskOutcome<T> = std::result::Result<T, TaskFailure>;

/// Identifies a registered completion listener for later removal.
pub type ListenerId = u64;

struct Listener {
	id: ListenerId,
	job: Job,
	via: Option<Arc<dyn Executor>>,
}

enum State<T> {
	Pending { listeners: Vec<Listener> },
	Done(TaskOutcome<T>),
}

struct Shared<T> {
	state: Mutex<State<T>>,
	done: Condvar,
	swallow_listener_panics: bool,
	next_listener: AtomicU64,
	cancel_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Completion handle for a submitted task.
///
/// Listeners registered before completion fire when the task resolves;
/// listeners registered after fire immediately. Either way a listener runs
/// inline on the registering/completing thread unless an [`Executor`] was
/// supplied for delivery. Whether a panicking listener is swallowed or
/// propagated is fixed at creation time.
pub struct TaskFuture<T> {
	shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<T: Send + 'static> TaskFuture<T> {
	pub fn new(swallow_listener_panics: bool) -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(State::Pending {
					listeners: Vec::new(),
				}),
				done: Condvar::new(),
				swallow_listener_panics,
				next_listener: AtomicU64::new(0),
				cancel_hook: Mutex::new(None),
			}),
		}
	}

	/// Resolves the future. Returns false if it already resolved.
	pub fn complete(&self, outcome: TaskOutcome<T>) -> bool {
		let listeners = {
			let mut state = self.shared.state.lock();
			match &mut *state {
				State::Done(_) => return false,
				State::Pending { listeners } => {
					let listeners = std::mem::take(listeners);
					*state = State::Done(outcome);
					self.shared.done.notify_all();
					listeners
				}
			}
		};
		for listener in listeners {
			self.fire(listener);
		}
		true
	}

	/// Cancels the task: resolves the future with
	/// [`TaskFailure::Canceled`] and notifies the producer-side hook so
	/// the queued task short-circuits. A task that already resolved is
	/// unaffected.
	pub fn cancel(&self) -> bool {
		if !self.complete(Err(TaskFailure::Canceled)) {
			return false;
		}
		if let Some(hook) = self.shared.cancel_hook.lock().as_ref() {
			hook();
		}
		true
	}

	/// Installs the producer-side cancel hook; called at most once, at
	/// submission time.
	pub fn set_cancel_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
		*self.shared.cancel_hook.lock() = Some(Box::new(hook));
	}

	/// Registers a listener firing inline on the completing thread.
	pub fn add_listener(&self, f: impl FnOnce() + Send + 'static) -> ListenerId {
		self.register(Box::new(f), None)
	}

	/// Registers a listener delivered through `executor`.
	pub fn add_listener_via(&self, f: impl FnOnce() + Send + 'static, executor: Arc<dyn Executor>) -> ListenerId {
		self.register(Box::new(f), Some(executor))
	}

	fn register(&self, job: Job, via: Option<Arc<dyn Executor>>) -> ListenerId {
		let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
		{
			let mut state = self.shared.state.lock();
			if let State::Pending { listeners } = &mut *state {
				listeners.push(Listener {
					id,
					job,
					via,
				});
				return id;
			}
		}
		// Already done: fire immediately, outside the state lock.
		self.fire(Listener {
			id,
			job,
			via,
		});
		id
	}

	/// Drops a not-yet-fired listener. Returns whether one was removed.
	pub fn remove_listener(&self, id: ListenerId) -> bool {
		let mut state = self.shared.state.lock();
		match &mut *state {
			State::Pending { listeners } => {
				let before = listeners.len();
				listeners.retain(|listener| listener.id != id);
				listeners.len() != before
			}
			State::Done(_) => false,
		}
	}

	/// Drops every not-yet-fired listener, returning how many there were.
	pub fn clear_listeners(&self) -> usize {
		let mut state = self.shared.state.lock();
		match &mut *state {
			State::Pending { listeners } => std::mem::take(listeners).len(),
			State::Done(_) => 0,
		}
	}

	pub fn is_done(&self) -> bool {
		matches!(&*self.shared.state.lock(), State::Done(_))
	}

	fn fire(&self, listener: Listener) {
		match listener.via {
			Some(executor) => executor.execute_job(listener.job),
			None if self.shared.swallow_listener_panics => {
				if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(listener.job)) {
					warn!("completion listener panicked: {}", crate::panic_message(payload.as_ref()));
				}
			}
			None => (listener.job)(),
		}
	}
}

impl<T: Send + Clone + 'static> TaskFuture<T> {
	/// The outcome, if the task already resolved.
	pub fn outcome(&self) -> Option<TaskOutcome<T>> {
		match &*self.shared.state.lock() {
			State::Done(outcome) => Some(outcome.clone()),
			State::Pending { .. } => None,
		}
	}

	/// Blocks until the task resolves.
	pub fn wait(&self) -> TaskOutcome<T> {
		let mut state = self.shared.state.lock();
		loop {
			if let State::Done(outcome) = &*state {
				return outcome.clone();
			}
			self.shared.done.wait(&mut state);
		}
	}

	/// Blocks until the task resolves or `timeout` elapses.
	pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome<T>> {
		let deadline = std::time::Instant::now() + timeout;
		let mut state = self.shared.state.lock();
		loop {
			if let State::Done(outcome) = &*state {
				return Some(outcome.clone());
			}
			if self.shared.done.wait_until(&mut state, deadline).timed_out() {
				return match &*state {
					State::Done(outcome) => Some(outcome.clone()),
					State::Pending { .. } => None,
				};
			}
		}
	}
}
