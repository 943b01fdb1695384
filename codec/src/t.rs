//! The 't' protocol: unchecksummed, length-framed, for links already
//! reliable end to end such as a TCP stream (§4.2.2). Commands are
//! NUL-padded to a multiple of 512 bytes; file data is framed with a 4-byte
//! big-endian length prefix, with a zero-length frame marking end of file.

use std::time::{Duration, Instant};

use channel::{Channel, ReadStatus};
use log::warn;
use utils::error::Result;

use crate::protocol::{Capabilities, FileHandle, Letter, Protocol, Reliability, WaitOutcome};

/// Commands are padded out to a multiple of this size (§4.2.2).
pub const COMMAND_BLOCK: usize = 512;
/// Default timeout for a single frame read.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Frame payloads larger than this are rejected as noise rather than an
/// attempt to allocate an unreasonable buffer.
pub const MAX_FRAME: u32 = 1024 * 1024;

pub struct TProtocol {
	timeout: Duration,
	pending: std::collections::VecDeque<Vec<u8>>,
}

impl TProtocol {
	pub fn new() -> Self {
		Self { timeout: DEFAULT_TIMEOUT, pending: std::collections::VecDeque::new() }
	}

	fn read_exact(&self, channel: &mut dyn Channel, buf: &mut [u8], deadline: Instant) -> Result<bool> {
		let mut filled = 0;
		while filled < buf.len() {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Ok(false);
			}
			let (n, status) = channel.read_with_timeout(&mut buf[filled..], buf.len() - filled, remaining, true)?;
			if status == ReadStatus::Timeout {
				return Ok(false);
			}
			filled += n;
		}
		Ok(true)
	}

	fn read_frame(&self, channel: &mut dyn Channel) -> Result<Option<Vec<u8>>> {
		let deadline = Instant::now() + self.timeout;

		let mut len_bytes = [0u8; 4];
		if !self.read_exact(channel, &mut len_bytes, deadline)? {
			return Ok(None);
		}
		let len = u32::from_be_bytes(len_bytes);
		if len > MAX_FRAME {
			warn!("'t' protocol frame length {len} exceeds {MAX_FRAME}, treating as framing loss");
			return Err(());
		}

		let mut payload = vec![0u8; len as usize];
		if !self.read_exact(channel, &mut payload, deadline)? {
			return Ok(None);
		}
		Ok(Some(payload))
	}
}

impl Default for TProtocol {
	fn default() -> Self {
		Self::new()
	}
}

impl Protocol for TProtocol {
	fn letter(&self) -> Letter {
		Letter::T
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			full_duplex: true,
			multi_channel_count: 1,
			reliability_class: Reliability::RELIABLE | Reliability::END_TO_END | Reliability::FULL_DUPLEX,
		}
	}

	fn start(&mut self, _channel: &mut dyn Channel, _is_master: bool) -> Result<bool> {
		// No handshake: the link is assumed reliable and ordered already.
		Ok(true)
	}

	fn shutdown(&mut self, _channel: &mut dyn Channel) -> Result<bool> {
		Ok(true)
	}

	fn send_cmd(&mut self, channel: &mut dyn Channel, text: &str) -> Result<bool> {
		let mut bytes = text.as_bytes().to_vec();
		bytes.push(0);
		let padded = bytes.len().div_ceil(COMMAND_BLOCK) * COMMAND_BLOCK;
		bytes.resize(padded, 0);
		channel.write(&bytes)?;
		Ok(true)
	}

	fn segment_size(&self) -> usize {
		COMMAND_BLOCK
	}

	fn send_data(&mut self, channel: &mut dyn Channel, data: &[u8], _local: u8, _remote: u8, _filepos: Option<u64>) -> Result<bool> {
		channel.write(&(data.len() as u32).to_be_bytes())?;
		channel.write(data)?;
		Ok(false)
	}

	fn wait(&mut self, channel: &mut dyn Channel) -> Result<WaitOutcome> {
		let Some(frame) = self.read_frame(channel)? else {
			warn!("'t' protocol read timed out waiting for a frame");
			return Err(());
		};
		let outcome = if frame.is_empty() && self.pending.is_empty() {
			// A lone zero-length frame with no prior frames could be either
			// an empty command or EOF; the multiplexer (which knows which
			// channel is in flight) resolves the ambiguity, so surface it
			// as progress either way.
			WaitOutcome::FileProgress
		} else {
			WaitOutcome::CommandReady
		};
		self.pending.push_back(frame);
		Ok(outcome)
	}

	fn file(&mut self, _handle: &FileHandle, _is_start: bool, _is_send: bool, _bytes: Option<u64>) -> Result<bool> {
		Ok(false)
	}

	fn poll_payload(&mut self) -> Option<Vec<u8>> {
		self.pending.pop_front()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_padded_to_block_multiple() {
		let mut t = TProtocol::new();
		let mut captured = Vec::new();
		struct Sink<'a>(&'a mut Vec<u8>);
		impl Channel for Sink<'_> {
			fn write(&mut self, bytes: &[u8]) -> Result<()> {
				self.0.extend_from_slice(bytes);
				Ok(())
			}
			fn read_with_timeout(&mut self, _buf: &mut [u8], _want: usize, _timeout: Duration, _report_errors: bool) -> Result<(usize, ReadStatus)> {
				Ok((0, ReadStatus::Timeout))
			}
			fn send_break(&mut self) -> Result<()> {
				Ok(())
			}
			fn ring(&mut self) -> &mut channel::RingBuffer {
				unimplemented!()
			}
		}

		let mut sink = Sink(&mut captured);
		t.send_cmd(&mut sink, "S file1 file2 user -").unwrap();
		assert_eq!(captured.len() % COMMAND_BLOCK, 0);
		assert_eq!(captured[captured.len() - 1], 0);
	}
}
