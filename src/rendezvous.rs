//! Binary rendezvous signal used to match a blocking send against the
//! reader thread's eventual resolution of it.
//!
//! Invariant I3: at most one caller waits on a given rendezvous at a time.
//! This is enforced by [`crate::dte::Dte`] serializing its send surface
//! (one in-flight command at a time), not by this type itself. A
//! `Rendezvous` is a plain signal, not a mutex guarding a resource.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A single-slot, level-triggered signal: [`Rendezvous::signal`] sets it,
/// [`Rendezvous::wait_timeout`] blocks until it is set (or already is) and
/// then clears it.
pub struct Rendezvous {
	ready: Mutex<bool>,
	condvar: Condvar,
}

impl Rendezvous {
	pub fn new() -> Self {
		Self {
			ready: Mutex::new(false),
			condvar: Condvar::new(),
		}
	}

	/// Blocks until signalled or `timeout` elapses. Returns `true` if
	/// signalled, `false` on timeout. Clears the signal either way it was
	/// found set, so a stray signal never leaks into the next wait.
	pub fn wait_timeout(&self, timeout: Duration) -> bool {
		let guard = self.ready.lock().unwrap();
		let (mut guard, result) = self
			.condvar
			.wait_timeout_while(guard, timeout, |ready| !*ready)
			.unwrap();
		let was_ready = !result.timed_out() || *guard;
		*guard = false;
		was_ready
	}

	/// Sets the signal and wakes the single waiter, if any. Called by the
	/// reader thread once a DCE handler (one-shot or reusable) has resolved
	/// the line or frame the waiter is blocked on.
	pub fn signal(&self) {
		*self.ready.lock().unwrap() = true;
		self.condvar.notify_one();
	}

	/// Clears the signal without waiting. Used when a wait is abandoned
	/// (e.g. after a timeout already consumed it) and a stale signal must
	/// not leak into the next command.
	pub fn reset(&self) {
		*self.ready.lock().unwrap() = false;
	}
}

impl Default for Rendezvous {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;

	#[test]
	fn wait_returns_false_on_timeout_with_no_signal() {
		let r = Rendezvous::new();
		assert!(!r.wait_timeout(Duration::from_millis(20)));
	}

	#[test]
	fn signal_before_wait_is_observed() {
		let r = Rendezvous::new();
		r.signal();
		assert!(r.wait_timeout(Duration::from_millis(20)));
	}

	#[test]
	fn signal_from_another_thread_wakes_the_waiter() {
		let r = Arc::new(Rendezvous::new());
		let r2 = r.clone();
		let handle = thread::spawn(move || {
			thread::sleep(Duration::from_millis(20));
			r2.signal();
		});
		assert!(r.wait_timeout(Duration::from_secs(1)));
		handle.join().unwrap();
	}

	#[test]
	fn a_consumed_signal_does_not_leak_into_the_next_wait() {
		let r = Rendezvous::new();
		r.signal();
		assert!(r.wait_timeout(Duration::from_millis(20)));
		assert!(!r.wait_timeout(Duration::from_millis(20)));
	}
}
