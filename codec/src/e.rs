//! The 'e' protocol: the same framing philosophy as 't' (no checksum, no
//! retransmit, relies on a transport that is already reliable) but with a
//! narrower length header suited to transports that cap a single frame at
//! 64KiB rather than 4GiB (§4.2.4 specifies this "by analogy" to 't').

use std::time::{Duration, Instant};

use channel::{Channel, ReadStatus};
use log::warn;
use utils::error::Result;

use crate::protocol::{Capabilities, FileHandle, Letter, Protocol, Reliability, WaitOutcome};

pub const COMMAND_BLOCK: usize = 512;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// 'e' frames are length-prefixed with a 16-bit header, unlike 't''s
/// 32-bit one, so a single frame cannot exceed this.
pub const MAX_FRAME: u16 = u16::MAX;

pub struct EProtocol {
	timeout: Duration,
	pending: std::collections::VecDeque<Vec<u8>>,
}

impl EProtocol {
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

		let mut len_bytes = [0u8; 2];
		if !self.read_exact(channel, &mut len_bytes, deadline)? {
			return Ok(None);
		}
		let len = u16::from_be_bytes(len_bytes);

		let mut payload = vec![0u8; len as usize];
		if !self.read_exact(channel, &mut payload, deadline)? {
			return Ok(None);
		}
		Ok(Some(payload))
	}
}

impl Default for EProtocol {
	fn default() -> Self {
		Self::new()
	}
}

impl Protocol for EProtocol {
	fn letter(&self) -> Letter {
		Letter::E
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			full_duplex: true,
			multi_channel_count: 1,
			reliability_class: Reliability::RELIABLE | Reliability::END_TO_END | Reliability::FULL_DUPLEX,
		}
	}

	fn start(&mut self, _channel: &mut dyn Channel, _is_master: bool) -> Result<bool> {
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
		if data.len() > MAX_FRAME as usize {
			warn!("'e' protocol frame length {} exceeds {MAX_FRAME}", data.len());
			return Err(());
		}
		channel.write(&(data.len() as u16).to_be_bytes())?;
		channel.write(data)?;
		Ok(false)
	}

	fn wait(&mut self, channel: &mut dyn Channel) -> Result<WaitOutcome> {
		let Some(frame) = self.read_frame(channel)? else {
			warn!("'e' protocol read timed out waiting for a frame");
			return Err(());
		};
		let outcome = if frame.is_empty() && self.pending.is_empty() { WaitOutcome::FileProgress } else { WaitOutcome::CommandReady };
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
	fn oversized_frame_rejected() {
		let mut e = EProtocol::new();
		struct Sink;
		impl Channel for Sink {
			fn write(&mut self, _bytes: &[u8]) -> Result<()> {
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
		let mut sink = Sink;
		let oversized = vec![0u8; MAX_FRAME as usize + 1];
		assert!(e.send_data(&mut sink, &oversized, 0, 0, None).is_err());
	}
}
