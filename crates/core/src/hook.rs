// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Strand

use std::any::Any;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::error;

type Hook = Box<dyn Fn(&str) + Send + Sync>;

static UNCAUGHT: Lazy<RwLock<Hook>> = Lazy::new(|| RwLock::new(Box::new(default_hook)));

fn default_hook(message: &str) {
	error!("task panicked: {message}");
}

/// Installs the process-wide hook receiving panics that escape user tasks.
///
/// The hook observes the rendered panic message. Workers keep running after
/// invoking it.
pub fn set_uncaught_panic_hook(hook: impl Fn(&str) + Send + Sync + 'static) {
	*UNCAUGHT.write() = Box::new(hook);
}

/// Forwards a caught panic payload to the uncaught-panic hook.
pub fn report_uncaught_panic(payload: Box<dyn Any + Send>) {
	let message = panic_message(payload.as_ref());
	let hook = UNCAUGHT.read();
	(*hook)(&message);
}

/// Renders a panic payload to a readable message.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
	payload.downcast_ref::<&str>()
		.map(|s| s.to_string())
		.or_else(|| payload.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "non-string panic payload".to_string())
}
