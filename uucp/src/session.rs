//! The pre-protocol dialogue (§4.6): `Shere`/`S<self>` exchange, `ROK`/
//! `ROKN`/refusal, protocol election, and the final `OOOOOO`/`OOOOOOO`
//! hangup handshake. Chat-script login happens before any of this and is
//! out of scope here.

use std::time::Duration;

use channel::{Channel, RecvByte};
use codec::{for_letter, Letter, Protocol};
use log::warn;
use utils::error::Result;

use crate::config::PeerConfig;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

fn send_line(channel: &mut dyn Channel, text: &str) -> Result<()> {
	let mut buf = Vec::with_capacity(text.len() + 2);
	buf.push(0x10);
	buf.extend_from_slice(text.as_bytes());
	buf.push(0);
	channel.write(&buf)
}

fn read_line(channel: &mut dyn Channel, timeout: Duration) -> Result<String> {
	let mut buf = Vec::new();
	loop {
		match channel.recv_byte(timeout)? {
			RecvByte::Byte(0) => break,
			RecvByte::Byte(0x10) if buf.is_empty() => {}
			RecvByte::Byte(b) => buf.push(b),
			RecvByte::Timeout => {
				warn!("pre-protocol read timed out waiting for a reply");
				return Err(());
			}
		}
	}
	Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// One character at a time, matching the reference's echo-check cadence
/// (§5, 5 s per character) rather than the NUL-terminated command framing
/// `send_line`/`read_line` use.
fn read_token(channel: &mut dyn Channel, max_len: usize) -> Result<String> {
	let mut buf = String::new();
	for _ in 0..max_len {
		match channel.recv_byte(ECHO_TIMEOUT)? {
			RecvByte::Byte(b) => buf.push(b as char),
			RecvByte::Timeout => break,
		}
	}
	Ok(buf)
}

/// A refusal code in a `R<reason>` reply (§4.6, §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Refusal {
	Login,
	Locked,
	BadSeq,
	CallBack,
	Other(String),
}

fn parse_refusal(line: &str) -> Refusal {
	match line.strip_prefix('R') {
		Some("LOGIN") => Refusal::Login,
		Some("LCK") => Refusal::Locked,
		Some("BADSEQ") => Refusal::BadSeq,
		Some("CB") => Refusal::CallBack,
		Some(other) => Refusal::Other(other.to_string()),
		None => Refusal::Other(line.to_string()),
	}
}

/// The options a caller may attach to its `S<self>` reply (§4.6).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerOptions {
	pub self_name: String,
	pub sequence: Option<String>,
	pub requested_grade: Option<char>,
	pub size_negotiation: bool,
	pub role_switch_refused: bool,
	pub ulimit_blocks: Option<u64>,
	pub debug: Option<String>,
}

fn parse_caller_line(line: &str) -> Option<CallerOptions> {
	let mut parts = line.split_whitespace();
	let head = parts.next()?;
	let self_name = head.strip_prefix('S')?.to_string();
	let mut opts = CallerOptions { self_name, ..Default::default() };

	for tok in parts {
		if let Some(seq) = tok.strip_prefix("-Q") {
			opts.sequence = Some(seq.to_string());
		} else if let Some(g) = tok.strip_prefix("-vgrade=") {
			opts.requested_grade = g.chars().next();
		} else if let Some(g) = tok.strip_prefix("-p") {
			opts.requested_grade = g.chars().next();
		} else if tok == "-N" {
			opts.size_negotiation = true;
		} else if tok == "-R" {
			opts.role_switch_refused = true;
		} else if let Some(u) = tok.strip_prefix("-U") {
			opts.ulimit_blocks = u.parse().ok();
		} else if let Some(x) = tok.strip_prefix("-x") {
			opts.debug = Some(x.to_string());
		}
	}
	Some(opts)
}

/// Pick a protocol from the callee's offered letter list (§4.6):
/// preferring `config`'s declared order, else the first whose reliability
/// requirement the link is known to satisfy.
fn elect_protocol(offered: &str, config: &PeerConfig) -> Option<Box<dyn Protocol>> {
	let mut candidates: Vec<Box<dyn Protocol>> = offered
		.chars()
		.filter_map(Letter::from_char)
		.map(for_letter)
		.filter(|p| config.reliability.contains(p.capabilities().reliability_class))
		.collect();

	for &preferred in &config.protocol_letters {
		if let Some(idx) = candidates.iter().position(|p| p.letter().as_char() == preferred) {
			return Some(candidates.remove(idx));
		}
	}
	candidates.into_iter().next()
}

/// How the caller's dial attempt concluded.
pub enum DialOutcome {
	Connected { protocol: Box<dyn Protocol>, size_negotiated: bool },
	CallBack,
	Refused(Refusal),
}

/// Run the caller side of the pre-protocol dialogue (§4.6). The caller
/// starts as master.
pub fn dial(channel: &mut dyn Channel, self_name: &str, peer_name_hint: Option<&str>, config: &PeerConfig) -> Result<DialOutcome> {
	let truncated = |s: &str| -> String { s.chars().take(7).collect() };

	let greeting = read_line(channel, COMMAND_TIMEOUT)?;
	let greeting_ok = if greeting == "Shere" {
		true
	} else if let Some(rest) = greeting.strip_prefix("Shere=") {
		match peer_name_hint {
			Some(expected) => truncated(rest) == truncated(expected),
			None => true,
		}
	} else {
		false
	};
	if !greeting_ok {
		warn!("unexpected greeting from callee: {greeting:?}");
		return Err(());
	}

	let mut reply = format!("S{self_name}");
	if config.size_negotiation {
		reply.push_str(" -N");
	}
	send_line(channel, &reply)?;

	let reply_line = read_line(channel, COMMAND_TIMEOUT)?;
	let size_negotiated = match reply_line.as_str() {
		"ROK" => false,
		"ROKN" => true,
		"RCB" => return Ok(DialOutcome::CallBack),
		other => return Ok(DialOutcome::Refused(parse_refusal(other))),
	};

	let proto_line = read_line(channel, COMMAND_TIMEOUT)?;
	let Some(offered) = proto_line.strip_prefix('P') else {
		warn!("expected a P<letters> line, got {proto_line:?}");
		return Err(());
	};

	let Some(mut protocol) = elect_protocol(offered, config) else {
		send_line(channel, "UN")?;
		return Ok(DialOutcome::Refused(Refusal::Other("no mutually supported protocol".into())));
	};

	send_line(channel, &format!("U{}", protocol.letter().as_char()))?;
	protocol.start(channel, true)?;

	Ok(DialOutcome::Connected { protocol, size_negotiated })
}

/// How the callee's answer concluded.
pub enum AnswerOutcome {
	Connected { protocol: Box<dyn Protocol>, size_negotiated: bool },
	Refused(Refusal),
}

/// Run the callee side of the pre-protocol dialogue (§4.6). The callee
/// starts as slave.
pub fn answer(channel: &mut dyn Channel, self_name: &str, config: &PeerConfig) -> Result<AnswerOutcome> {
	send_line(channel, &format!("Shere={self_name}"))?;

	let line = read_line(channel, COMMAND_TIMEOUT)?;
	let Some(opts) = parse_caller_line(&line) else {
		warn!("unparseable caller line: {line:?}");
		send_line(channel, "RBADSEQ")?;
		return Ok(AnswerOutcome::Refused(Refusal::BadSeq));
	};

	let size_negotiated = config.size_negotiation && opts.size_negotiation;
	send_line(channel, if size_negotiated { "ROKN" } else { "ROK" })?;

	let letters: String = config.protocol_letters.iter().collect();
	send_line(channel, &format!("P{letters}"))?;

	let u_line = read_line(channel, COMMAND_TIMEOUT)?;
	let Some(rest) = u_line.strip_prefix('U') else {
		warn!("expected a U<letter> line, got {u_line:?}");
		return Err(());
	};
	if rest == "N" {
		return Ok(AnswerOutcome::Refused(Refusal::Other("caller found no mutually supported protocol".into())));
	}
	let Some(letter) = rest.chars().next().and_then(Letter::from_char) else {
		return Ok(AnswerOutcome::Refused(Refusal::Other(u_line)));
	};

	let mut protocol = for_letter(letter);
	protocol.start(channel, false)?;

	Ok(AnswerOutcome::Connected { protocol, size_negotiated })
}

/// The caller's half of the final hangup handshake (§4.6): send `OOOOOO`
/// twice, then read the callee's `OOOOOOO` echo. A mismatch is logged,
/// not propagated — the other side may already have hung up.
pub fn hangup_caller(channel: &mut dyn Channel) -> Result<()> {
	channel.write(b"OOOOOO")?;
	channel.write(b"OOOOOO")?;
	match read_token(channel, 7) {
		Ok(tok) if tok == "OOOOOOO" => {}
		Ok(other) => warn!("expected OOOOOOO echo from callee, got {other:?}"),
		Err(()) => warn!("timed out waiting for callee's hangup echo"),
	}
	Ok(())
}

/// The callee's half of the final hangup handshake (§4.6).
pub fn hangup_callee(channel: &mut dyn Channel) -> Result<()> {
	channel.write(b"OOOOOOO")?;
	channel.write(b"OOOOOOO")?;
	match read_token(channel, 6) {
		Ok(tok) if tok == "OOOOOO" => {}
		Ok(other) => warn!("expected OOOOOO echo from caller, got {other:?}"),
		Err(()) => warn!("timed out waiting for caller's hangup echo"),
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_caller_options() {
		let opts = parse_caller_line("Sbilbo -Q42 -vgrade=b -N -U2000").unwrap();
		assert_eq!(opts.self_name, "bilbo");
		assert_eq!(opts.sequence.as_deref(), Some("42"));
		assert_eq!(opts.requested_grade, Some('b'));
		assert!(opts.size_negotiation);
		assert_eq!(opts.ulimit_blocks, Some(2000));
	}

	#[test]
	fn parses_refusal_codes() {
		assert_eq!(parse_refusal("RLOGIN"), Refusal::Login);
		assert_eq!(parse_refusal("RLCK"), Refusal::Locked);
		assert_eq!(parse_refusal("RBADSEQ"), Refusal::BadSeq);
		assert_eq!(parse_refusal("RCB"), Refusal::CallBack);
	}

	#[test]
	fn elects_preferred_letter_when_offered() {
		let mut config = PeerConfig::new();
		config.reliability = codec::Reliability::all();
		config.protocol_letters = vec!['t', 'g'];

		let chosen = elect_protocol("gtf", &config).unwrap();
		assert_eq!(chosen.letter(), Letter::T);
	}

	#[test]
	fn falls_back_to_first_mutually_supported_letter() {
		let mut config = PeerConfig::new();
		config.reliability = codec::Reliability::all();

		let chosen = elect_protocol("ft", &config).unwrap();
		assert_eq!(chosen.letter(), Letter::F);
	}
}
