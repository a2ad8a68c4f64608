// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	thread,
	time::{Duration, Instant},
};

use strand_core::{Error, TaskFailure, set_uncaught_panic_hook};
use strand_pool::{PoolConfig, PriorityScheduler};
use strand_testing::{Latch, Recorder, wait_until};

fn fixed(size: usize) -> PriorityScheduler {
	PriorityScheduler::new(PoolConfig::fixed(size)).expect("valid config")
}

#[test]
fn test_execute_runs_submitted_tasks() {
	let scheduler = fixed(2);
	let counter = Arc::new(AtomicUsize::new(0));
	let done = Arc::new(Latch::new(10));

	for _ in 0..10 {
		let counter = Arc::clone(&counter);
		let done = Arc::clone(&done);
		scheduler
			.execute(move || {
				counter.fetch_add(1, Ordering::Relaxed);
				done.count_down();
			})
			.expect("submission accepted");
	}

	assert!(done.wait(Duration::from_secs(5)), "tasks did not finish");
	assert_eq!(counter.load(Ordering::Relaxed), 10);
	scheduler.shutdown_now();
}

#[test]
fn test_same_priority_tasks_run_in_submission_order() {
	let scheduler = fixed(1);
	let gate = Arc::new(Latch::new(1));
	let order = Arc::new(Recorder::new());

	let blocker_gate = Arc::clone(&gate);
	scheduler.execute(move || {
		blocker_gate.wait(Duration::from_secs(5));
	}).expect("submission accepted");

	for i in 0..10 {
		let order = Arc::clone(&order);
		scheduler
			.execute(move || order.record(i))
			.expect("submission accepted");
	}
	gate.count_down();

	assert!(wait_until(Duration::from_secs(5), || order.len() == 10));
	assert_eq!(order.snapshot(), (0..10).collect::<Vec<_>>());
	scheduler.shutdown_now();
}

#[test]
fn test_schedule_honors_delay() {
	let scheduler = fixed(1);
	let (tx, rx) = crossbeam_channel::bounded(1);
	let submitted = Instant::now();

	scheduler
		.schedule(Duration::from_millis(60), move || {
			tx.send(submitted.elapsed()).ok();
		})
		.expect("submission accepted");

	assert!(rx.recv_timeout(Duration::from_millis(20)).is_err(), "task ran before its delay");
	let elapsed = rx.recv_timeout(Duration::from_secs(2)).expect("task ran");
	assert!(elapsed >= Duration::from_millis(50), "ran after only {elapsed:?}");
	assert!(elapsed <= Duration::from_millis(500), "ran late, after {elapsed:?}");
	scheduler.shutdown_now();
}

#[test]
fn test_submit_resolves_future_with_value() {
	let scheduler = fixed(1);
	let future = scheduler.submit(|| 21 * 2).expect("submission accepted");
	assert_eq!(future.wait(), Ok(42));
	scheduler.shutdown_now();
}

#[test]
fn test_submit_panic_completes_future_exceptionally() {
	let scheduler = fixed(1);
	let future = scheduler.submit(|| -> u32 { panic!("task body failed") }).expect("submission accepted");
	match future.wait() {
		Err(TaskFailure::Panicked(message)) => assert!(message.contains("task body failed")),
		other => panic!("expected panicked outcome, got {other:?}"),
	}
	// The pool survives the panic.
	let after = scheduler.submit(|| 7).expect("submission accepted");
	assert_eq!(after.wait(), Ok(7));
	scheduler.shutdown_now();
}

#[test]
fn test_panics_reach_uncaught_hook() {
	let seen = Arc::new(Recorder::new());
	let seen_hook = Arc::clone(&seen);
	set_uncaught_panic_hook(move |message| seen_hook.record(message.to_string()));

	let scheduler = fixed(1);
	scheduler.execute(|| panic!("hook-marker-4631")).expect("submission accepted");

	assert!(wait_until(Duration::from_secs(5), || {
		seen.snapshot().iter().any(|message| message.contains("hook-marker-4631"))
	}));
	scheduler.shutdown_now();
}

#[test]
fn test_remove_prevents_execution() {
	let scheduler = fixed(1);
	let counter = Arc::new(AtomicUsize::new(0));

	let counter_clone = Arc::clone(&counter);
	let handle = scheduler
		.schedule(Duration::from_millis(50), move || {
			counter_clone.fetch_add(1, Ordering::Relaxed);
		})
		.expect("submission accepted");

	assert!(scheduler.remove(&handle));
	assert!(!scheduler.remove(&handle));
	assert!(handle.is_canceled());

	thread::sleep(Duration::from_millis(150));
	assert_eq!(counter.load(Ordering::Relaxed), 0, "removed task ran anyway");
	scheduler.shutdown_now();
}

#[test]
fn test_cancel_prevents_execution() {
	let scheduler = fixed(1);
	let counter = Arc::new(AtomicUsize::new(0));

	let counter_clone = Arc::clone(&counter);
	let handle = scheduler
		.schedule(Duration::from_millis(40), move || {
			counter_clone.fetch_add(1, Ordering::Relaxed);
		})
		.expect("submission accepted");
	handle.cancel();

	thread::sleep(Duration::from_millis(120));
	assert_eq!(counter.load(Ordering::Relaxed), 0, "canceled task ran anyway");
	scheduler.shutdown_now();
}

#[test]
fn test_cancel_resolves_submitted_future() {
	let scheduler = fixed(1);
	let gate = Arc::new(Latch::new(1));

	let blocker_gate = Arc::clone(&gate);
	scheduler.execute(move || {
		blocker_gate.wait(Duration::from_secs(5));
	}).expect("submission accepted");

	let future = scheduler.submit(|| 1).expect("submission accepted");
	assert!(future.cancel());
	gate.count_down();

	assert_eq!(future.wait(), Err(TaskFailure::Canceled));
	scheduler.shutdown_now();
}

#[test]
fn test_queued_task_count_tracks_both_lanes() {
	use strand_pool::Priority;

	let scheduler = fixed(1);
	let gate = Arc::new(Latch::new(1));
	let blocker_gate = Arc::clone(&gate);
	scheduler.execute(move || {
		blocker_gate.wait(Duration::from_secs(5));
	}).expect("submission accepted");

	for _ in 0..3 {
		scheduler.schedule_with_priority(Priority::High, Duration::from_secs(5), || {}).expect("accepted");
	}
	scheduler.schedule_with_priority(Priority::Low, Duration::from_secs(5), || {}).expect("accepted");

	assert_eq!(scheduler.queued_task_count(Priority::High), 3);
	assert_eq!(scheduler.queued_task_count(Priority::Low), 1);
	gate.count_down();
	scheduler.shutdown_now();
}

#[test]
fn test_zero_rate_period_is_rejected() {
	let scheduler = fixed(1);
	let result = scheduler.schedule_at_fixed_rate(Duration::ZERO, Duration::ZERO, || {});
	assert!(matches!(result, Err(Error::InvalidConfig(_))));
	scheduler.shutdown_now();
}

#[test]
fn test_invalid_pool_sizes_are_rejected() {
	let zero_core = PriorityScheduler::new(PoolConfig {
		core_pool_size: 0,
		..PoolConfig::default()
	});
	assert!(matches!(zero_core, Err(Error::InvalidConfig(_))));

	let max_below_core = PriorityScheduler::new(PoolConfig {
		core_pool_size: 4,
		max_pool_size: 2,
		..PoolConfig::default()
	});
	assert!(matches!(max_below_core, Err(Error::InvalidConfig(_))));
}
