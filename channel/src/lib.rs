use std::time::Duration;

use utils::error::Result;

/// A colored, timestamped `log::Log` installed by the `uucico` binary.
/// Library crates never install this themselves.
pub mod logger;
/// The shared ring buffer backing [`Channel::read_with_timeout`].
pub mod ringbuf;
/// A poll-driven [`Channel`] over any unix file descriptor.
#[cfg(unix)]
pub mod unix;

pub use ringbuf::RingBuffer;

/// The outcome of a timed read (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
	/// 1..=want bytes were delivered.
	Ok,
	/// No bytes arrived before the deadline.
	Timeout,
}

/// A single byte, or a timeout, from [`Channel::recv_byte`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvByte {
	Byte(u8),
	Timeout,
}

/// A duplex byte stream with timed read, blocking write, and BREAK
/// generation (§4.1). Implementations hide whether a read actually blocks
/// or polls; callers only assume that requesting `want` bytes with timeout
/// `t` either delivers `1..=want` bytes within `t` or reports a timeout.
pub trait Channel {
	/// Write `bytes` in full, blocking until the channel accepts them all.
	fn write(&mut self, bytes: &[u8]) -> Result<()>;

	/// Read up to `want` bytes into `buf[..want]`, waiting at most
	/// `timeout`. On success, returns the number of bytes actually
	/// delivered (1..=want) and [`ReadStatus::Ok`]. On expiry with nothing
	/// delivered, returns `(0, ReadStatus::Timeout)`.
	fn read_with_timeout(&mut self, buf: &mut [u8], want: usize, timeout: Duration, report_errors: bool) -> Result<(usize, ReadStatus)>;

	/// Read a single byte, or report a timeout.
	fn recv_byte(&mut self, timeout: Duration) -> Result<RecvByte> {
		let mut byte = [0u8; 1];
		match self.read_with_timeout(&mut byte, 1, timeout, true)? {
			(1, ReadStatus::Ok) => Ok(RecvByte::Byte(byte[0])),
			_ => Ok(RecvByte::Timeout),
		}
	}

	/// Emit a line-BREAK.
	fn send_break(&mut self) -> Result<()>;

	/// Whether this channel is half-duplex. A half-duplex link forces the
	/// link layer into a single logical channel (§4.1, §4.3
	/// `multi_channel_count`).
	fn half_duplex(&self) -> bool {
		false
	}

	/// Direct access to the shared ring buffer, for protocols that prefer
	/// to decode packets in place rather than through the byte-oriented
	/// read API (§4.1, §9 "ring-buffered in-place decode").
	fn ring(&mut self) -> &mut RingBuffer;
}
