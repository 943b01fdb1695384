//! The 'g' protocol: windowed, checksummed, 8-bit clean (§4.2.1).

mod window;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use channel::{Channel, ReadStatus};
use collections::ring::Ring;
use log::{debug, warn};
use utils::error::Result;

pub mod header;
use header::{ControlSub as Sub, Header, Kind};
use window::Window;

use crate::checksum;
use crate::protocol::{Capabilities, FileHandle, Letter, Protocol, Reliability, WaitOutcome};

/// Default timeout for a single packet read (§4.2.1, §5).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default retries per init step, and total start retries (§4.2.1).
pub const DEFAULT_RETRIES: u32 = 4;
pub const DEFAULT_TOTAL_RETRIES: u32 = 8;
/// Default bound on `bad_hdr + bad_checksum + adjusted_out_of_order +
/// remote_rejects` before the session is failed (§4.2.1).
pub const DEFAULT_ERROR_BOUND: u32 = 100;

#[derive(Default)]
struct ErrorCounts {
	bad_hdr: u32,
	bad_checksum: u32,
	out_of_order: u32,
	remote_rejects: u32,
}

enum Decoded {
	Control { sub: Sub, yyy: u8 },
	Data { seq: u8, ack: u8, payload: Vec<u8> },
	BadChecksum { seq: u8 },
	/// A noise byte, a truncated read, or an unrecognized header; already
	/// accounted for in `ErrorCounts`.
	Noise,
}

/// Negotiated parameters agreed during `start` (§3 "Protocol state").
pub struct Params {
	pub window: u8,
	pub seg_k: u8,
	pub eager_ack: bool,
	pub timeout: Duration,
	pub retries: u32,
	pub error_bound: u32,
}

impl Default for Params {
	fn default() -> Self {
		Self {
			window: 7,
			seg_k: 5, // 512-byte segments
			eager_ack: true,
			timeout: DEFAULT_TIMEOUT,
			retries: DEFAULT_RETRIES,
			error_bound: DEFAULT_ERROR_BOUND,
		}
	}
}

pub struct GProtocol {
	params: Params,
	win: Window,
	rec_seq: u8,
	local_ack: u8,
	ring: Ring<Vec<u8>, 8>,
	errors: ErrorCounts,
	pending: VecDeque<Vec<u8>>,
	closed: bool,
}

impl GProtocol {
	pub fn new(params: Params) -> Self {
		Self {
			params,
			win: Window::new(),
			rec_seq: 0,
			local_ack: 0,
			ring: Ring::new(),
			errors: ErrorCounts::default(),
			pending: VecDeque::new(),
			closed: false,
		}
	}

	fn seg_bytes(&self) -> usize {
		header::segment_size(self.params.seg_k).expect("negotiated seg_k is always 1..=8")
	}

	fn encode_control(&self, sub: Sub, yyy: u8) -> Vec<u8> {
		let control = header::pack_control(Kind::Control, sub.code(), yyy);
		let datacheck = checksum::control_datacheck(control);
		let check = checksum::header_check(datacheck, control);
		Header { k: header::CONTROL_K, check, control }.encode().to_vec()
	}

	fn encode_data(&self, is_short: bool, seq: u8, ack: u8, user_data: &[u8]) -> Vec<u8> {
		let segsize = self.seg_bytes();
		let mut payload = vec![0u8; segsize];
		let kind;

		if is_short {
			let u = (segsize - user_data.len()) as u16;
			let prefix = header::encode_short_prefix(u);
			payload[..prefix.len()].copy_from_slice(&prefix);
			payload[prefix.len()..prefix.len() + user_data.len()].copy_from_slice(user_data);
			kind = Kind::ShortData;
		} else {
			payload[..user_data.len()].copy_from_slice(user_data);
			kind = Kind::Data;
		}

		let datacheck = checksum::packet_checksum(&payload);
		let control = header::pack_control(kind, seq, ack);
		let check = checksum::header_check(datacheck, control);

		let mut out = Header { k: self.params.seg_k, check, control }.encode().to_vec();
		out.extend_from_slice(&payload);
		out
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

	/// Scan for and decode one packet, or `None` on timeout.
	fn recv_one(&mut self, channel: &mut dyn Channel, timeout: Duration) -> Result<Option<Decoded>> {
		let deadline = Instant::now() + timeout;

		let mut byte = [0u8; 1];
		loop {
			if !self.read_exact(channel, &mut byte, deadline)? {
				return Ok(None);
			}
			if byte[0] == header::DLE {
				break;
			}
			self.errors.bad_hdr += 1;
		}

		let mut rest = [0u8; 5];
		if !self.read_exact(channel, &mut rest, deadline)? {
			return Ok(None);
		}

		let mut full = [0u8; 6];
		full[0] = header::DLE;
		full[1..].copy_from_slice(&rest);

		let header = match Header::decode(full) {
			Ok(h) => h,
			Err(()) => {
				self.errors.bad_hdr += 1;
				return Ok(Some(Decoded::Noise));
			}
		};

		if header.k == header::CONTROL_K {
			let (kind, xxx, yyy) = header::unpack_control(header.control);
			if kind != Kind::Control {
				self.errors.bad_hdr += 1;
				return Ok(Some(Decoded::Noise));
			}

			let datacheck = checksum::control_datacheck(header.control);
			if checksum::header_check(datacheck, header.control) != header.check {
				self.errors.bad_checksum += 1;
				return Ok(Some(Decoded::Noise));
			}

			let Some(sub) = Sub::from_code(xxx) else {
				self.errors.bad_hdr += 1;
				return Ok(Some(Decoded::Noise));
			};

			return Ok(Some(Decoded::Control { sub, yyy }));
		}

		let Some(segsize) = header::segment_size(header.k) else {
			self.errors.bad_hdr += 1;
			return Ok(Some(Decoded::Noise));
		};

		let mut payload = vec![0u8; segsize];
		if !self.read_exact(channel, &mut payload, deadline)? {
			return Ok(None);
		}

		let (kind, seq, ack) = header::unpack_control(header.control);
		let datacheck = checksum::packet_checksum(&payload);

		if checksum::header_check(datacheck, header.control) != header.check {
			self.errors.bad_checksum += 1;
			return Ok(Some(Decoded::BadChecksum { seq }));
		}

		let data = match kind {
			Kind::Data => payload,
			Kind::ShortData => {
				let (u, prefix_len) = header::decode_short_prefix(&payload);
				let user_len = segsize - u as usize;
				payload[prefix_len..prefix_len + user_len].to_vec()
			}
			_ => {
				self.errors.bad_hdr += 1;
				return Ok(Some(Decoded::Noise));
			}
		};

		Ok(Some(Decoded::Data { seq, ack, payload: data }))
	}

	fn apply_ack(&mut self, channel: &mut dyn Channel, ack: u8) -> Result {
		match self.win.retransmit_seq {
			Some(seq) if ack == seq => {
				self.resend(channel, seq)?;
				self.resend(channel, (seq + 1) % 8)?;
				self.win.retransmit_seq = Some((seq + 1) % 8);
			}
			_ => self.win.ack(ack),
		}
		Ok(())
	}

	fn resend(&mut self, channel: &mut dyn Channel, seq: u8) -> Result {
		if let Some(packet) = self.ring.get(seq as u64) {
			channel.write(packet)?;
		}
		Ok(())
	}

	fn error_ceiling_exceeded(&self) -> bool {
		let window = self.params.window.max(1) as u32;
		let discount = self.errors.bad_checksum.saturating_mul(window - 1);
		let adjusted_ooo = self.errors.out_of_order.saturating_sub(discount);
		self.errors.bad_hdr + self.errors.bad_checksum + adjusted_ooo + self.errors.remote_rejects > self.params.error_bound
	}

	fn handle_decoded(&mut self, channel: &mut dyn Channel, decoded: Decoded) -> Result<WaitOutcome> {
		match decoded {
			Decoded::Noise => Ok(WaitOutcome::Idle),

			Decoded::Control { sub: Sub::Close, .. } => {
				self.closed = true;
				Ok(WaitOutcome::Idle)
			}

			Decoded::Control { sub: Sub::Rr, yyy } => {
				self.apply_ack(channel, yyy)?;
				Ok(WaitOutcome::Idle)
			}

			Decoded::Control { sub: Sub::Rj, yyy } | Decoded::Control { sub: Sub::Srj, yyy } => {
				self.errors.remote_rejects += 1;
				self.win.reject(yyy);
				self.resend(channel, (yyy + 1) % 8)?;
				Ok(WaitOutcome::Idle)
			}

			Decoded::Control { sub, .. } => {
				warn!("Unexpected 'g' control packet during data phase: {sub:?}");
				Ok(WaitOutcome::Idle)
			}

			Decoded::BadChecksum { seq } => {
				if seq == (self.rec_seq + 1) % 8 {
					self.send_pending_rrs(channel)?;
					channel.write(&self.encode_control(Sub::Rj, self.rec_seq))?;
				}
				Ok(WaitOutcome::Idle)
			}

			Decoded::Data { seq, ack, payload } => {
				self.apply_ack(channel, ack)?;

				if seq != self.rec_seq {
					self.errors.out_of_order += 1;
					return Ok(WaitOutcome::Idle);
				}

				self.rec_seq = (self.rec_seq + 1) % 8;
				self.local_ack = self.rec_seq;

				if self.params.eager_ack {
					channel.write(&self.encode_control(Sub::Rr, self.rec_seq))?;
				}

				let is_eof = payload.is_empty();
				self.pending.push_back(payload);

				Ok(if is_eof { WaitOutcome::FileProgress } else { WaitOutcome::FileProgress })
			}
		}
	}

	fn send_pending_rrs(&mut self, channel: &mut dyn Channel) -> Result {
		channel.write(&self.encode_control(Sub::Rr, self.rec_seq))
	}

	fn init_step(&self, channel: &mut dyn Channel, outgoing: Sub, yyy: u8, expect: Sub) -> Result<Option<u8>> {
		channel.write(&self.encode_control(outgoing, yyy))?;

		match channel.recv_byte(self.params.timeout)? {
			channel::RecvByte::Timeout => return Ok(None),
			channel::RecvByte::Byte(b) if b != header::DLE => return Ok(None),
			_ => {}
		}

		let mut rest = [0u8; 5];
		channel.read_with_timeout(&mut rest, 5, self.params.timeout, true)?;
		let mut full = [0u8; 6];
		full[0] = header::DLE;
		full[1..].copy_from_slice(&rest);

		let Ok(header) = Header::decode(full) else { return Ok(None) };
		if header.k != header::CONTROL_K {
			return Ok(None);
		}

		let (kind, xxx, yyy) = header::unpack_control(header.control);
		if kind != Kind::Control {
			return Ok(None);
		}

		let Some(got) = Sub::from_code(xxx) else { return Ok(None) };

		if got == expect {
			Ok(Some(yyy))
		} else {
			// The peer is ahead of us in the handshake (our previous packet
			// was lost); signal the caller to restart at INITA.
			Ok(None)
		}
	}
}

impl Protocol for GProtocol {
	fn letter(&self) -> Letter {
		Letter::G
	}

	fn capabilities(&self) -> Capabilities {
		Capabilities {
			full_duplex: true,
			multi_channel_count: 1,
			reliability_class: Reliability::EIGHT_BIT,
		}
	}

	fn start(&mut self, channel: &mut dyn Channel, _is_master: bool) -> Result<bool> {
		let mut attempts = 0;

		'restart: loop {
			if attempts >= DEFAULT_TOTAL_RETRIES {
				warn!("'g' protocol initialization exceeded {DEFAULT_TOTAL_RETRIES} total retries");
				return Err(());
			}

			for _ in 0..self.params.retries {
				attempts += 1;
				if self.init_step(channel, Sub::InitA, self.params.window, Sub::InitA)?.is_some() {
					break;
				}
			}

			for _ in 0..self.params.retries {
				attempts += 1;
				match self.init_step(channel, Sub::InitB, self.params.seg_k - 1, Sub::InitB)? {
					Some(_) => {
						for _ in 0..self.params.retries {
							attempts += 1;
							match self.init_step(channel, Sub::InitC, self.params.window, Sub::InitC)? {
								Some(w) => {
									self.params.window = self.params.window.min(w.max(1));
									debug!("'g' protocol initialized: window={}, seg_k={}", self.params.window, self.params.seg_k);
									return Ok(true);
								}
								None => continue 'restart,
							}
						}
						continue 'restart;
					}
					None => continue 'restart,
				}
			}

			continue 'restart;
		}
	}

	fn shutdown(&mut self, channel: &mut dyn Channel) -> Result<bool> {
		channel.write(&self.encode_control(Sub::Close, 0))?;
		self.closed = true;
		Ok(true)
	}

	fn send_cmd(&mut self, channel: &mut dyn Channel, text: &str) -> Result<bool> {
		let segsize = self.seg_bytes();
		let mut bytes = text.as_bytes().to_vec();
		bytes.push(0);

		let chunks: Vec<&[u8]> = bytes.chunks(segsize).collect();

		for (i, chunk) in chunks.iter().enumerate() {
			let is_last = i + 1 == chunks.len();
			let is_short = is_last && chunk.len() < segsize;

			while !self.win.can_send(self.params.window) {
				let Some(decoded) = self.recv_one(channel, self.params.timeout)? else {
					warn!("Timed out waiting for window space while sending command");
					return Err(());
				};
				self.handle_decoded(channel, decoded)?;
				if self.error_ceiling_exceeded() {
					return Err(());
				}
			}

			let packet = self.encode_data(is_short, self.win.send_seq, self.local_ack, chunk);
			let seq = self.win.sent();
			self.ring.insert(seq as u64, packet.clone());
			channel.write(&packet)?;
		}

		Ok(true)
	}

	fn segment_size(&self) -> usize {
		self.seg_bytes()
	}

	fn send_data(&mut self, channel: &mut dyn Channel, data: &[u8], _local: u8, _remote: u8, _filepos: Option<u64>) -> Result<bool> {
		let segsize = self.seg_bytes();
		let is_short = data.len() < segsize;

		while !self.win.can_send(self.params.window) {
			let Some(decoded) = self.recv_one(channel, self.params.timeout)? else {
				warn!("Timed out waiting for window space while sending data");
				return Err(());
			};
			self.handle_decoded(channel, decoded)?;
			if self.error_ceiling_exceeded() {
				return Err(());
			}
		}

		let packet = self.encode_data(is_short, self.win.send_seq, self.local_ack, data);
		let seq = self.win.sent();
		self.ring.insert(seq as u64, packet.clone());
		channel.write(&packet)?;

		Ok(false)
	}

	fn wait(&mut self, channel: &mut dyn Channel) -> Result<WaitOutcome> {
		loop {
			let Some(decoded) = self.recv_one(channel, self.params.timeout)? else {
				warn!("'g' protocol read timed out waiting for a packet");
				return Err(());
			};

			let outcome = self.handle_decoded(channel, decoded)?;

			if self.error_ceiling_exceeded() {
				warn!("'g' protocol error ceiling exceeded, failing session");
				return Err(());
			}

			if outcome != WaitOutcome::Idle || !self.pending.is_empty() {
				return Ok(outcome);
			}
		}
	}

	fn file(&mut self, _handle: &FileHandle, _is_start: bool, _is_send: bool, _bytes: Option<u64>) -> Result<bool> {
		// 'g' has no per-file negotiation beyond the segment size agreed at
		// `start`; the scheduler queues the transfer itself.
		Ok(false)
	}

	fn error_count(&self) -> u32 {
		self.errors.bad_hdr + self.errors.bad_checksum + self.errors.out_of_order + self.errors.remote_rejects
	}

	fn poll_payload(&mut self) -> Option<Vec<u8>> {
		self.pending.pop_front()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn data_and_shortdata_round_trip() {
		let mut g = GProtocol::new(Params { seg_k: 1, ..Default::default() }); // 32-byte segments

		let full = g.encode_data(false, 2, 1, &[1u8; 32]);
		let header = Header::decode(full[..6].try_into().unwrap()).unwrap();
		assert_eq!(header.k, 1);
		let payload = &full[6..];
		let datacheck = checksum::packet_checksum(payload);
		assert_eq!(checksum::header_check(datacheck, header.control), header.check);

		let short = g.encode_data(true, 3, 2, b"hi");
		let header = Header::decode(short[..6].try_into().unwrap()).unwrap();
		let (kind, seq, ack) = header::unpack_control(header.control);
		assert_eq!(kind, Kind::ShortData);
		assert_eq!((seq, ack), (3, 2));
	}

	#[test]
	fn zero_length_payload_signals_eof() {
		let mut g = GProtocol::new(Params::default());
		g.pending.push_back(Vec::new());
		assert_eq!(g.poll_payload(), Some(Vec::new()));
	}
}
