//! The 'f' protocol: a 7-bit-clean encoding for links that cannot pass
//! arbitrary bytes, with a whole-file checksum trailer in lieu of
//! per-packet checking (§4.2.3).

use std::time::{Duration, Instant};

use channel::{Channel, ReadStatus};
use log::warn;
use utils::error::Result;

use crate::checksum::RunningChecksum;
use crate::protocol::{Capabilities, FileHandle, Letter, Protocol, Reliability, WaitOutcome};

pub const ESC_LOW: u8 = 0o172;
pub const ESC_MID: u8 = 0o173;
pub const ESC_HIGH: u8 = 0o174;
pub const ESC_HIGHER: u8 = 0o175;
pub const ESC_TOP: u8 = 0o176;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Encode one byte of the original stream into its 7-bit wire form
/// (§4.2.3's table, covering 0x00..=0xFF with no overlap).
fn encode_byte(b: u8, out: &mut Vec<u8>) {
	match b {
		0x00..=0x1f => {
			out.push(ESC_LOW);
			out.push(b + 0x40);
		}
		0x20..=0x79 => out.push(b),
		0x7a..=0x7f => {
			out.push(ESC_MID);
			out.push(b - 0x40);
		}
		0x80..=0x9f => {
			out.push(ESC_HIGH);
			out.push(b - 0x40);
		}
		0xa0..=0xf9 => {
			out.push(ESC_HIGHER);
			out.push(b - 0x80);
		}
		0xfa..=0xff => {
			out.push(ESC_TOP);
			out.push(b - 0xc0);
		}
	}
}

pub fn encode(data: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len());
	for &b in data {
		encode_byte(b, &mut out);
	}
	out
}

/// Decode one escape-prefixed or literal byte starting at `input[0]`,
/// returning `(decoded, consumed)`. `input[0] == ESC_TOP` followed by
/// another `ESC_TOP` is the checksum trailer marker, not data, and is
/// rejected here so callers must peek for it first.
fn decode_one(input: &[u8]) -> Option<(u8, usize)> {
	let lead = *input.first()?;
	let prefix_base = match lead {
		ESC_LOW => Some(0x00u8.wrapping_sub(0x40)),
		ESC_MID => Some(0x40u8),
		ESC_HIGH => Some(0x40u8),
		ESC_HIGHER => Some(0x80u8),
		ESC_TOP => Some(0xc0u8),
		_ => None,
	};

	if let Some(base) = prefix_base {
		let follow = *input.get(1)?;
		return Some((follow.wrapping_add(base), 2));
	}

	Some((lead, 1))
}

/// Decode a fully-buffered escaped stream back to the original bytes.
pub fn decode(input: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(input.len());
	let mut i = 0;
	while i < input.len() {
		let Some((b, consumed)) = decode_one(&input[i..]) else { break };
		out.push(b);
		i += consumed;
	}
	out
}

pub struct FProtocol {
	timeout: Duration,
	max_retries: u32,
	pending: std::collections::VecDeque<Vec<u8>>,
	file_checksum: RunningChecksum,
}

impl FProtocol {
	pub fn new() -> Self {
		Self { timeout: DEFAULT_TIMEOUT, max_retries: DEFAULT_MAX_RETRIES, pending: std::collections::VecDeque::new(), file_checksum: RunningChecksum::new() }
	}

	fn read_line(&self, channel: &mut dyn Channel, deadline: Instant) -> Result<Option<Vec<u8>>> {
		let mut line = Vec::new();
		loop {
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return Ok(None);
			}
			let mut byte = [0u8; 1];
			let (n, status) = channel.read_with_timeout(&mut byte, 1, remaining, true)?;
			if status == ReadStatus::Timeout || n == 0 {
				return Ok(None);
			}
			if byte[0] == b'\r' {
				return Ok(Some(line));
			}
			line.push(byte[0]);
		}
	}

	/// Send the post-file `0176 0176 hhhh\r` checksum trailer and collect
	/// the receiver's `G`/`R` reply, resending the whole file from position
	/// 0 on `R` up to `max_retries` times (§4.2.3; 'f' keeps no partial-file
	/// restart, unlike 'g').
	fn send_trailer(&mut self, channel: &mut dyn Channel) -> Result<bool> {
		let hhhh = self.file_checksum.finish();
		let mut trailer = vec![ESC_TOP, ESC_TOP];
		trailer.extend(format!("{hhhh:04x}\r").into_bytes());
		channel.write(&trailer)?;

		let deadline = Instant::now() + self.timeout;
		match self.read_line(channel, deadline)?.as_deref() {
			Some([b'G', ..]) => Ok(true),
			Some([b'R', ..]) => Ok(false),
			_ => {
				warn!("'f' protocol timed out waiting for checksum reply");
				Err(())
			}
		}
	}
}

impl Default for FProtocol {
	fn default() -> Self {
		Self::new()
	}
}

impl Protocol for FProtocol {
	fn letter(&self) -> Letter {
		Letter::F
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			full_duplex: false,
			multi_channel_count: 1,
			reliability_class: Reliability::SPECIFIED,
		}
	}

	fn start(&mut self, _channel: &mut dyn Channel, _is_master: bool) -> Result<bool> {
		Ok(true)
	}

	fn shutdown(&mut self, _channel: &mut dyn Channel) -> Result<bool> {
		Ok(true)
	}

	fn send_cmd(&mut self, channel: &mut dyn Channel, text: &str) -> Result<bool> {
		let mut line = encode(text.as_bytes());
		line.push(b'\r');
		channel.write(&line)?;
		Ok(true)
	}

	fn segment_size(&self) -> usize {
		// 'f' has no fixed segment; the caller may send whatever chunk size
		// is convenient since framing is line/trailer based, not length
		// based. Matches the reference's practice of reading a full buffer
		// per write(2).
		4096
	}

	fn send_data(&mut self, channel: &mut dyn Channel, data: &[u8], _local: u8, _remote: u8, _filepos: Option<u64>) -> Result<bool> {
		if data.is_empty() {
			for attempt in 0..=self.max_retries {
				if self.send_trailer(channel)? {
					self.file_checksum = RunningChecksum::new();
					return Ok(false);
				}
				warn!("'f' protocol receiver requested retransmit (attempt {attempt})");
			}
			warn!("'f' protocol exceeded max retries on whole-file checksum");
			return Err(());
		}

		self.file_checksum.push(data);
		channel.write(&encode(data))?;
		Ok(false)
	}

	fn wait(&mut self, channel: &mut dyn Channel) -> Result<WaitOutcome> {
		let deadline = Instant::now() + self.timeout;
		let Some(raw) = self.read_line(channel, deadline)? else {
			warn!("'f' protocol read timed out waiting for a command line");
			return Err(());
		};
		self.pending.push_back(decode(&raw));
		Ok(WaitOutcome::CommandReady)
	}

	fn file(&mut self, _handle: &FileHandle, is_start: bool, _is_send: bool, _bytes: Option<u64>) -> Result<bool> {
		if is_start {
			self.file_checksum = RunningChecksum::new();
		}
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
	fn escape_table_covers_full_byte_range_with_no_overlap() {
		for b in 0u16..=255 {
			let encoded = encode(&[b as u8]);
			let decoded = decode(&encoded);
			assert_eq!(decoded, vec![b as u8], "byte {b:#04x} did not round trip");
		}
	}

	#[test]
	fn printable_ascii_passes_through_unescaped() {
		assert_eq!(encode(b"hello"), b"hello");
	}

	#[test]
	fn control_and_high_bytes_are_escaped() {
		assert_eq!(encode(&[0x00]), vec![ESC_LOW, 0x40]);
		assert_eq!(encode(&[0xff]), vec![ESC_TOP, 0xff - 0xc0]);
	}

	#[test]
	fn checksum_trailer_accumulates_across_send_data_calls() {
		let data = b"spool file contents";
		let mut f = FProtocol::new();
		f.file_checksum.push(data);

		let mut reference = RunningChecksum::new();
		reference.push(data);
		assert_eq!(f.file_checksum.finish(), reference.finish());
	}
}
