pub mod checksum;
pub mod e;
pub mod f;
pub mod g;
pub mod protocol;
pub mod t;

pub use protocol::{Capabilities, FileHandle, Letter, Protocol, Reliability, WaitOutcome};

/// Build the protocol implementation for one of the four wire letters
/// (§4.3, §4.6 "protocol election").
pub fn for_letter(letter: Letter) -> Box<dyn Protocol> {
	match letter {
		Letter::G => Box::new(g::GProtocol::new(g::Params::default())),
		Letter::T => Box::new(t::TProtocol::new()),
		Letter::F => Box::new(f::FProtocol::new()),
		Letter::E => Box::new(e::EProtocol::new()),
	}
}
