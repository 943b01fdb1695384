use bitflags::bitflags;
use channel::Channel;
use utils::error::Result;

/// One entry from the transfer manager's work queues (§4.3, §4.5). The
/// frame codec never inspects the file contents itself; it only needs to
/// know where the transfer is, file-position bookkeeping, and its local /
/// remote channel ids.
pub struct FileHandle {
	pub local: u8,
	pub remote: u8,
	pub pos: u64,
}

bitflags! {
	/// Reliability classes a link can offer (§4.6, §6). Used both to
	/// describe a port/dialer's known properties and to gate which
	/// protocols are acceptable over it.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct Reliability: u8 {
		const SPECIFIED  = 0b0000_0001;
		const EIGHT_BIT  = 0b0000_0010;
		const RELIABLE   = 0b0000_0100;
		const END_TO_END = 0b0000_1000;
		const FULL_DUPLEX = 0b0001_0000;
	}
}

/// Static capabilities of a protocol letter (§4.3).
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
	pub full_duplex: bool,
	/// Number of logical channels this protocol can multiplex; 1 unless the
	/// protocol tags payloads with channel ids.
	pub multi_channel_count: u8,
	pub reliability_class: Reliability,
}

/// The single-character identifier of a wire protocol (§1, §4.6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Letter {
	G,
	T,
	F,
	E,
}

impl Letter {
	pub fn as_char(self) -> char {
		match self {
			Letter::G => 'g',
			Letter::T => 't',
			Letter::F => 'f',
			Letter::E => 'e',
		}
	}

	pub fn from_char(c: char) -> Option<Self> {
		match c {
			'g' => Some(Letter::G),
			't' => Some(Letter::T),
			'f' => Some(Letter::F),
			'e' => Some(Letter::E),
			_ => None,
		}
	}
}

/// Outcome of [`Protocol::wait`]: whether control should return to the
/// scheduler because a command finished assembling or a file transfer made
/// progress worth acting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
	/// A full command line was delivered to the multiplexer's accumulator.
	CommandReady,
	/// A file transfer advanced (data written, or end-of-file seen).
	FileProgress,
	/// Nothing of note happened before internal housekeeping returned
	/// control (e.g. an ack-only packet was processed).
	Idle,
}

/// The link-layer vtable of §4.3: one implementation per wire protocol.
/// `psendfn`/`precfn` in the reference become the caller driving this
/// trait's methods one step per scheduler iteration.
pub trait Protocol {
	fn letter(&self) -> Letter;
	fn capabilities(&self) -> Capabilities;

	/// Run this protocol's initialization handshake.
	fn start(&mut self, channel: &mut dyn Channel, is_master: bool) -> Result<bool>;

	/// Emit a shutdown marker (CLOSE for 'g', or equivalent) and flush
	/// statistics.
	fn shutdown(&mut self, channel: &mut dyn Channel) -> Result<bool>;

	/// Deliver a null-terminated command.
	fn send_cmd(&mut self, channel: &mut dyn Channel, text: &str) -> Result<bool>;

	/// The current segment size in bytes, for callers sizing their own
	/// buffers before calling [`send_data`](Protocol::send_data).
	fn segment_size(&self) -> usize;

	/// Transmit one data payload on the given logical channel. `len == 0`
	/// signals end-of-file. Returns whether a rekey/restart was
	/// triggered as a side effect (protocol-specific; 'g' and 't'/'f'
	/// never set this, reserved for future multi-channel protocols).
	fn send_data(&mut self, channel: &mut dyn Channel, data: &[u8], local: u8, remote: u8, filepos: Option<u64>) -> Result<bool>;

	/// Block receiving and dispatching inbound packets until either a
	/// command is fully assembled or a file transfer completes a state
	/// transition worth returning control for.
	fn wait(&mut self, channel: &mut dyn Channel) -> Result<WaitOutcome>;

	/// Per-file hook: checksum reset for 'f', size negotiation for 'g'/'t',
	/// restart decisions. Returns whether the protocol has arranged its
	/// own next step, in which case the scheduler should not queue the
	/// transfer itself.
	fn file(&mut self, handle: &FileHandle, is_start: bool, is_send: bool, bytes: Option<u64>) -> Result<bool>;

	/// Bytes accumulated since the last reset, for the error ceiling of
	/// §4.2.1.
	fn error_count(&self) -> u32 {
		0
	}

	/// Drain one payload delivered to the framing multiplexer since the
	/// last call (FIFO). The reference invokes the multiplexer directly
	/// from inside the protocol's receive path; here the protocol buffers
	/// what it decoded and the caller drains it after [`wait`](Protocol::wait)
	/// returns, which keeps the codec crate free of any dependency on the
	/// multiplexer it feeds.
	fn poll_payload(&mut self) -> Option<Vec<u8>>;
}
