//! Cancellation flags (§5, §9 "Global mutable state"). SIGINT quiesces the
//! session: no new jobs are started but in-flight transfers finish.
//! SIGHUP/SIGQUIT/SIGTERM/SIGPIPE abort immediately. Flags are polled at
//! loop heads and between packet operations; there are no async signal
//! callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A process-wide pair of flags a [`crate::manager::Manager`] polls each
/// iteration. Cheap to clone; every clone shares the same underlying
/// atomics, so one `Signals` can be registered with the OS and also handed
/// to the manager.
#[derive(Clone, Default)]
pub struct Signals {
	quit: Arc<AtomicBool>,
	hangup_now: Arc<AtomicBool>,
}

impl Signals {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register the handlers this session cares about. Safe to call more
	/// than once; each call adds another flag write for the same signal.
	pub fn install(&self) -> std::io::Result<()> {
		signal_hook::flag::register(signal_hook::consts::SIGINT, self.quit.clone())?;
		for sig in [signal_hook::consts::SIGHUP, signal_hook::consts::SIGQUIT, signal_hook::consts::SIGTERM, signal_hook::consts::SIGPIPE] {
			signal_hook::flag::register(sig, self.hangup_now.clone())?;
		}
		Ok(())
	}

	/// SIGINT: stop queuing new jobs, let what's in flight complete.
	pub fn quit_requested(&self) -> bool {
		self.quit.load(Ordering::Relaxed)
	}

	/// SIGHUP/SIGQUIT/SIGTERM/SIGPIPE: abort now, regardless of in-flight
	/// work.
	pub fn hangup_now_requested(&self) -> bool {
		self.hangup_now.load(Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flags_start_clear() {
		let signals = Signals::new();
		assert!(!signals.quit_requested());
		assert!(!signals.hangup_now_requested());
	}

	#[test]
	fn clones_share_the_same_flags() {
		let signals = Signals::new();
		let clone = signals.clone();
		clone.quit.store(true, Ordering::Relaxed);
		assert!(signals.quit_requested());
	}
}
