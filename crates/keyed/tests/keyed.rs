// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::{
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	thread,
	time::Duration,
};

use parking_lot::Mutex;
use strand_core::Error;
use strand_keyed::KeyDistributor;
use strand_pool::{PoolConfig, PriorityScheduler};
use strand_testing::{Latch, Recorder, wait_until};

fn pool(size: usize) -> PriorityScheduler {
	PriorityScheduler::new(PoolConfig::fixed(size)).expect("valid config")
}

fn distributor(pool_size: usize, stripes: usize) -> KeyDistributor<&'static str> {
	KeyDistributor::with_stripes(pool(pool_size), stripes).expect("valid stripe count")
}

/// Per-key guarantee under interleaved load: strict submission order per
/// key, and never two tasks of one key in flight at once.
#[test]
fn test_same_key_tasks_run_in_order_without_overlap() {
	let distributor = distributor(4, 4);
	let order_a = Arc::new(Recorder::new());
	let order_b = Arc::new(Recorder::new());
	let in_flight_a = Arc::new(AtomicUsize::new(0));
	let in_flight_b = Arc::new(AtomicUsize::new(0));
	let overlap = Arc::new(AtomicBool::new(false));
	let done = Arc::new(Latch::new(200));

	for i in 0..100 {
		for (key, order, in_flight) in [("A", &order_a, &in_flight_a), ("B", &order_b, &in_flight_b)] {
			let order = Arc::clone(order);
			let in_flight = Arc::clone(in_flight);
			let overlap = Arc::clone(&overlap);
			let done = Arc::clone(&done);
			distributor
				.execute(key, move || {
					if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
						overlap.store(true, Ordering::SeqCst);
					}
					order.record(i);
					thread::yield_now();
					in_flight.fetch_sub(1, Ordering::SeqCst);
					done.count_down();
				})
				.expect("submission accepted");
		}
	}

	assert!(done.wait(Duration::from_secs(10)), "keyed tasks did not finish");
	assert!(!overlap.load(Ordering::SeqCst), "two tasks of one key ran concurrently");
	assert_eq!(order_a.snapshot(), (0..100).collect::<Vec<_>>());
	assert_eq!(order_b.snapshot(), (0..100).collect::<Vec<_>>());
	distributor.scheduler().shutdown_now();
}

/// Distinct keys make progress in parallel: a task for one key blocks
/// until a task for another key has run.
#[test]
fn test_distinct_keys_run_concurrently() {
	let distributor = distributor(4, 4);
	let b_ran = Arc::new(Latch::new(1));
	let a_observed_b = Arc::new(AtomicBool::new(false));

	{
		let b_ran = Arc::clone(&b_ran);
		let a_observed_b = Arc::clone(&a_observed_b);
		distributor
			.execute("A", move || {
				a_observed_b.store(b_ran.wait(Duration::from_secs(2)), Ordering::Release);
			})
			.expect("submission accepted");
	}
	{
		let b_ran = Arc::clone(&b_ran);
		distributor.execute("B", move || b_ran.count_down()).expect("submission accepted");
	}

	assert!(
		wait_until(Duration::from_secs(5), || a_observed_b.load(Ordering::Acquire)),
		"key B made no progress while key A was running"
	);
	distributor.scheduler().shutdown_now();
}

/// While a key's chain stays active, every task of the chain observes the
/// same worker thread.
#[test]
fn test_chain_keeps_thread_affinity_while_active() {
	let distributor = distributor(4, 4);
	let gate = Arc::new(Latch::new(1));
	let threads = Arc::new(Mutex::new(Vec::new()));
	let done = Arc::new(Latch::new(21));

	{
		let gate = Arc::clone(&gate);
		let threads = Arc::clone(&threads);
		let done = Arc::clone(&done);
		distributor
			.execute("A", move || {
				threads.lock().push(thread::current().id());
				gate.wait(Duration::from_secs(5));
				done.count_down();
			})
			.expect("submission accepted");
	}
	// These all join the active chain before it can drain.
	for _ in 0..20 {
		let threads = Arc::clone(&threads);
		let done = Arc::clone(&done);
		distributor
			.execute("A", move || {
				threads.lock().push(thread::current().id());
				done.count_down();
			})
			.expect("submission accepted");
	}
	gate.count_down();

	assert!(done.wait(Duration::from_secs(5)));
	let threads = threads.lock();
	assert_eq!(threads.len(), 21);
	assert!(threads.iter().all(|id| *id == threads[0]), "chain hopped worker threads while active");
	distributor.scheduler().shutdown_now();
}

#[test]
fn test_panicking_task_does_not_break_the_chain() {
	let distributor = distributor(2, 4);
	let done = Arc::new(Latch::new(1));

	distributor.execute("A", || panic!("keyed task failed")).expect("submission accepted");
	let done_clone = Arc::clone(&done);
	distributor.execute("A", move || done_clone.count_down()).expect("submission accepted");

	assert!(done.wait(Duration::from_secs(5)), "chain stalled after a panicking task");
	distributor.scheduler().shutdown_now();
}

/// The delay of a scheduled keyed task gates its enqueue: tasks submitted
/// meanwhile keep their place ahead of it.
#[test]
fn test_delayed_task_enqueues_after_delay() {
	let distributor = distributor(2, 4);
	let order = Arc::new(Recorder::new());

	let order_first = Arc::clone(&order);
	distributor.execute("A", move || order_first.record("immediate-1")).expect("submission accepted");

	let order_delayed = Arc::clone(&order);
	distributor
		.schedule("A", Duration::from_millis(60), move || order_delayed.record("delayed"))
		.expect("submission accepted");

	let order_second = Arc::clone(&order);
	distributor.execute("A", move || order_second.record("immediate-2")).expect("submission accepted");

	assert!(wait_until(Duration::from_secs(2), || order.len() == 3));
	assert_eq!(order.snapshot(), vec!["immediate-1", "immediate-2", "delayed"]);
	distributor.scheduler().shutdown_now();
}

#[test]
fn test_recurring_keyed_task_re_enqueues_until_canceled() {
	let distributor = distributor(2, 4);
	let runs = Arc::new(AtomicUsize::new(0));

	let runs_clone = Arc::clone(&runs);
	let handle = distributor
		.schedule_with_fixed_delay("A", Duration::ZERO, Duration::from_millis(25), move || {
			runs_clone.fetch_add(1, Ordering::Relaxed);
		})
		.expect("submission accepted");

	assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::Relaxed) >= 3));
	handle.cancel();

	thread::sleep(Duration::from_millis(80));
	let after_cancel = runs.load(Ordering::Relaxed);
	thread::sleep(Duration::from_millis(120));
	assert_eq!(runs.load(Ordering::Relaxed), after_cancel, "keyed recurrence survived cancel");
	distributor.scheduler().shutdown_now();
}

#[test]
fn test_queued_task_count_excludes_the_running_task() {
	let distributor = distributor(2, 4);
	let gate = Arc::new(Latch::new(1));
	let started = Arc::new(Latch::new(1));

	{
		let gate = Arc::clone(&gate);
		let started = Arc::clone(&started);
		distributor
			.execute("A", move || {
				started.count_down();
				gate.wait(Duration::from_secs(5));
			})
			.expect("submission accepted");
	}
	assert!(started.wait(Duration::from_secs(1)));

	for _ in 0..3 {
		distributor.execute("A", || {}).expect("submission accepted");
	}
	assert_eq!(distributor.queued_task_count(&"A"), 3);
	assert_eq!(distributor.queued_task_count(&"B"), 0);

	gate.count_down();
	assert!(wait_until(Duration::from_secs(2), || distributor.queued_task_count(&"A") == 0));
	distributor.scheduler().shutdown_now();
}

#[test]
fn test_single_stripe_preserves_per_key_guarantees() {
	let distributor = distributor(2, 1);
	let order = Arc::new(Recorder::new());
	let done = Arc::new(Latch::new(20));

	for i in 0..10 {
		for key in ["A", "B"] {
			let order = Arc::clone(&order);
			let done = Arc::clone(&done);
			distributor
				.execute(key, move || {
					order.record((key, i));
					done.count_down();
				})
				.expect("submission accepted");
		}
	}
	assert!(done.wait(Duration::from_secs(5)));

	let events = order.snapshot();
	let for_key = |key: &str| events.iter().filter(|(k, _)| *k == key).map(|(_, i)| *i).collect::<Vec<_>>();
	assert_eq!(for_key("A"), (0..10).collect::<Vec<_>>());
	assert_eq!(for_key("B"), (0..10).collect::<Vec<_>>());
	distributor.scheduler().shutdown_now();
}

#[test]
fn test_facade_pre_binds_its_key() {
	let distributor = distributor(2, 4);
	let facade = distributor.scheduler_for_key("A");
	assert_eq!(*facade.key(), "A");

	let order = Arc::new(Recorder::new());
	let order_direct = Arc::clone(&order);
	distributor.execute("A", move || order_direct.record("direct")).expect("submission accepted");
	let order_facade = Arc::clone(&order);
	facade.execute(move || order_facade.record("facade")).expect("submission accepted");

	assert!(wait_until(Duration::from_secs(2), || order.len() == 2));
	assert_eq!(order.snapshot(), vec!["direct", "facade"]);

	assert!(!facade.is_shutdown());
	distributor.scheduler().shutdown_now();
	assert!(facade.is_shutdown());
	assert!(distributor.is_shutdown());
}

#[test]
fn test_submissions_rejected_once_scheduler_is_shut_down() {
	let distributor = distributor(2, 4);
	distributor.scheduler().shutdown_now();

	assert!(matches!(distributor.execute("A", || {}), Err(Error::Rejected)));
	let facade = distributor.scheduler_for_key("A");
	assert!(matches!(facade.execute(|| {}), Err(Error::Rejected)));
}

#[test]
fn test_zero_stripe_count_is_rejected() {
	let result = KeyDistributor::<&str>::with_stripes(pool(1), 0);
	assert!(matches!(result, Err(Error::InvalidConfig(_))));
}
