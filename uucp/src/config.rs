//! Opaque-to-the-core configuration shapes (§6 "Environment / config").
//! No file-format parser lives here (parsing `uuconf`-style files is out
//! of scope per §1); a front end populates these from whatever its config
//! format is.

use std::collections::HashMap;
use std::time::Duration;

use codec::protocol::Reliability;

use crate::grade::TimetableEntry;

/// Per-protocol parameter overrides, keyed by protocol letter (§6).
#[derive(Clone, Debug, Default)]
pub struct ProtocolParams {
	pub window: Option<u8>,
	pub segment_k: Option<u8>,
	pub timeout: Option<Duration>,
	pub retries: Option<u32>,
}

/// A peer's or port's settings, opaque to the core beyond what it reads
/// here (§6).
#[derive(Clone, Debug, Default)]
pub struct PeerConfig {
	pub reliability: Reliability,
	pub protocol_params: HashMap<char, ProtocolParams>,
	pub grade_timetable: Vec<TimetableEntry>,
	pub protocol_letters: Vec<char>,
	/// The ceiling from `-N`: whether size negotiation is offered.
	pub size_negotiation: bool,
}

impl PeerConfig {
	pub fn new() -> Self {
		Self::default()
	}
}
