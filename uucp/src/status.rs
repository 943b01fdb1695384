//! Status-file fields (§6 "Status file fields", §7 retry schedule).
//!
//! Ordering matches the reference's `enum tstatus_type` (`azStatus` in
//! `lib/status.c`): `Complete` is success, the rest are failure kinds in
//! roughly escalating severity.

use std::time::{Duration, SystemTime};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Status {
	Complete = 0,
	PortFailed = 1,
	DialFailed = 2,
	LoginFailed = 3,
	HandshakeFailed = 4,
	CallFailed = 5,
	Talking = 6,
	WrongTime = 7,
}

/// After this many retries the system is locked out until an operator
/// removes the status file (§6).
pub const MAX_RETRIES: u32 = 26;

#[derive(Clone, Debug)]
pub struct StatusFile {
	pub status: Status,
	pub retries: u32,
	pub last_attempt: SystemTime,
}

impl StatusFile {
	pub fn new(status: Status) -> Self {
		Self { status, retries: 0, last_attempt: SystemTime::now() }
	}

	/// Record a failed attempt, advancing the retry counter.
	pub fn record_failure(&mut self, status: Status, now: SystemTime) {
		self.status = status;
		self.last_attempt = now;
		self.retries += 1;
	}

	pub fn record_success(&mut self, now: SystemTime) {
		self.status = Status::Complete;
		self.last_attempt = now;
		self.retries = 0;
	}

	/// Whether the maximum retry count (§6, default 26) has been reached;
	/// the caller must not retry and should require operator intervention.
	pub fn locked_out(&self) -> bool {
		self.retries >= MAX_RETRIES
	}

	/// The default retry schedule, `n * 600` seconds, absent a timetable
	/// `;retry` override (§7).
	pub fn retry_wait(&self) -> Duration {
		retry_wait(self.retries)
	}
}

pub fn retry_wait(attempt: u32) -> Duration {
	Duration::from_secs(u64::from(attempt) * 600)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retry_wait_scales_linearly() {
		assert_eq!(retry_wait(0), Duration::from_secs(0));
		assert_eq!(retry_wait(3), Duration::from_secs(1800));
	}

	#[test]
	fn lockout_after_max_retries() {
		let mut s = StatusFile::new(Status::Complete);
		s.retries = MAX_RETRIES - 1;
		assert!(!s.locked_out());
		s.record_failure(Status::CallFailed, SystemTime::now());
		assert!(s.locked_out());
	}
}
