//! The transfer manager main loop (§4.5): drains the four intrusive
//! queues, drives file-sending transfers through the link protocol a
//! segment at a time, and switches master/slave role when idle.

use channel::Channel;
use codec::protocol::{Protocol, WaitOutcome};
use log::warn;
use utils::error::Result;

use crate::cmd::{format_cmd, BCmd, Scmd};
use crate::mux::{Multiplexer, MuxEvent};
use crate::signals::Signals;
use crate::spool::Spool;
use crate::transfer::{Queue, Step, Transfer, Transfers};

/// A parsed reply line (§6 "Reply grammar"). Distinct from [`crate::cmd`]'s
/// command grammar: replies are sent by the manager directly as formatted
/// strings and only need to be recognized, not round-tripped, on the way
/// back in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyCode {
	SendOk,
	SendRefused(Option<u8>),
	ReceiveOk,
	ReceiveRefused(Option<u8>),
	WildcardOk,
	WildcardRefused,
	ReceiveComplete,
	ReceiveFailed,
}

fn parse_reply(line: &str) -> Option<ReplyCode> {
	let code_after = |prefix: &str| -> Option<Option<u8>> {
		let rest = line.strip_prefix(prefix)?;
		if rest.is_empty() {
			Some(None)
		} else {
			rest.trim().parse().ok().map(Some)
		}
	};

	if let Some(c) = code_after("SN") {
		return Some(ReplyCode::SendRefused(c));
	}
	if line.starts_with("SY") {
		return Some(ReplyCode::SendOk);
	}
	if let Some(c) = code_after("RN") {
		return Some(ReplyCode::ReceiveRefused(c));
	}
	if line.starts_with("RY") {
		return Some(ReplyCode::ReceiveOk);
	}
	if line == "XY" {
		return Some(ReplyCode::WildcardOk);
	}
	if line == "XN" {
		return Some(ReplyCode::WildcardRefused);
	}
	if line.starts_with("CY") {
		return Some(ReplyCode::ReceiveComplete);
	}
	if line.starts_with("CN") {
		return Some(ReplyCode::ReceiveFailed);
	}
	None
}

/// Drives one UUCP session's work once the link protocol has started
/// (§4.5). Owns the four intrusive queues; does not own the [`Protocol`]
/// or [`Channel`], which are session-scoped and shared with the
/// pre-protocol dialogue.
pub struct Manager {
	transfers: Transfers,
	mux: Multiplexer,
	is_master: bool,
	hanging_up: bool,
	done: bool,
	next_local_channel: u8,
	signals: Signals,
}

impl Manager {
	pub fn new(is_master: bool) -> Self {
		Self::with_signals(is_master, Signals::new())
	}

	/// Like [`Manager::new`], but polling the given [`Signals`] instead of a
	/// freshly created, never-installed pair (§5).
	pub fn with_signals(is_master: bool, signals: Signals) -> Self {
		Self { transfers: Transfers::new(), mux: Multiplexer::new(), is_master, hanging_up: false, done: false, next_local_channel: 1, signals }
	}

	pub fn is_done(&self) -> bool {
		self.done
	}

	fn alloc_local_channel(&mut self) -> u8 {
		let id = self.next_local_channel;
		self.next_local_channel = if id == u8::MAX { 1 } else { id + 1 };
		id
	}

	/// Queue one local job pulled from the spool (§4.5 step 1).
	fn enqueue_local(&mut self, spool: &mut dyn Spool, cmd: Scmd) {
		match cmd.bcmd {
			Some(BCmd::Send) | Some(BCmd::Execute) => {
				self.transfers.spawn(Transfer::new(cmd, now()), Queue::LocalReady);
			}
			Some(BCmd::Receive) => {
				self.transfers.spawn(Transfer::new(cmd, now()), Queue::LocalReady);
			}
			_ => {
				let _ = spool;
				warn!("spool returned a job with an unexpected leading command");
			}
		}
	}

	/// Run one iteration of the main loop (§4.5 steps 1-7). Returns
	/// whether the session should keep running.
	pub fn step(&mut self, protocol: &mut dyn Protocol, channel: &mut dyn Channel, spool: &mut dyn Spool, grade_floor: char) -> Result<bool> {
		if self.done {
			return Ok(false);
		}

		if self.signals.hangup_now_requested() {
			warn!("signaled to hang up now, abandoning in-flight transfers");
			self.fail_in_flight(spool);
			let _ = protocol.shutdown(channel);
			self.done = true;
			return Ok(false);
		}

		// Step 1. A pending quit (§5) only inhibits picking up *new* work;
		// it still lets the master offer to hang up once idle.
		if self.is_master && self.transfers.all_queues_empty() {
			let next = if self.signals.quit_requested() { None } else { spool.next_work(grade_floor) };
			match next {
				Some(cmd) => self.enqueue_local(spool, cmd),
				None => {
					if protocol.send_cmd(channel, "H").is_err() {
						warn!("failed to send H while becoming slave");
					}
					self.is_master = false;
				}
			}
		}

		// Step 2.
		while let Some(h) = self.transfers.pop_front(Queue::RemoteReady) {
			self.transfers.move_to(h, Queue::SendReady);
		}

		// Step 3.
		if self.is_master || protocol.capabilities().multi_channel_count > 1 {
			while let Some(h) = self.transfers.pop_front(Queue::LocalReady) {
				if let Some(t) = self.transfers.get_mut(h) {
					t.ilocal = self.alloc_local_channel();
				}
				self.transfers.move_to(h, Queue::SendReady);
			}
		}

		// Steps 4-5.
		if let Some(h) = self.transfers.peek_front(Queue::SendReady) {
			let sending = self.transfers.get(h).is_some_and(|t| t.sending_file);
			if sending {
				self.pump_send(protocol, channel, spool, h)?;
			} else {
				self.advance(protocol, channel, spool, h)?;
			}
			return Ok(true);
		}

		// Step 6.
		match protocol.wait(channel) {
			Ok(outcome) => self.service_wait(protocol, channel, spool, outcome, grade_floor)?,
			Err(()) => {
				self.fail_in_flight(spool);
				return Err(());
			}
		}

		Ok(!self.done)
	}

	/// Step 4: push one segment (or the EOF marker) of the head
	/// transfer's file, looping while no remote command has arrived and
	/// the protocol keeps accepting data.
	fn pump_send(&mut self, protocol: &mut dyn Protocol, channel: &mut dyn Channel, spool: &mut dyn Spool, handle: collections::pool::Handle) -> Result<()> {
		let segment = protocol.segment_size();
		loop {
			if self.signals.hangup_now_requested() {
				warn!("signaled to hang up now, aborting transfer mid-segment");
				break;
			}

			let Some(transfer) = self.transfers.get_mut(handle) else { break };
			let Some(source) = transfer.source.as_mut() else {
				warn!("sending transfer has no open source");
				break;
			};

			let mut buf = vec![0u8; segment];
			let n = match std::io::Read::read(source, &mut buf) {
				Ok(n) => n,
				Err(err) => {
					warn!("local read error while sending file: {err}");
					break;
				}
			};
			buf.truncate(n);

			let local = transfer.ilocal;
			let remote = transfer.iremote;
			let pos = transfer.ipos;

			match protocol.send_data(channel, &buf, local, remote, Some(pos)) {
				Ok(_) => {}
				Err(()) => {
					warn!("send_data failed, dropping connection");
					return Err(());
				}
			}

			if n == 0 {
				transfer.sending_file = false;
				transfer.step = Step::Finish;
				let pseq = transfer.cmd.pseq;
				spool.did_work(pseq);
				self.transfers.finish(handle);
				break;
			}
			transfer.ipos += n as u64;

			if self.transfers.queue_len(Queue::RemoteReady) > 0 {
				break;
			}
		}
		Ok(())
	}

	/// Step 5: invoke the head transfer's next step exactly once. For a
	/// transfer not yet sending, this means either transmitting our own
	/// queued command line (local `S`/`E`/`R`) or, for a transfer created
	/// from an inbound `R`, replying `RY` and opening the local file.
	fn advance(&mut self, protocol: &mut dyn Protocol, channel: &mut dyn Channel, spool: &mut dyn Spool, handle: collections::pool::Handle) -> Result<()> {
		let Some(transfer) = self.transfers.get_mut(handle) else { return Ok(()) };

		if transfer.cmd_sent {
			return Ok(());
		}

		match transfer.cmd.bcmd {
			Some(BCmd::Send) | Some(BCmd::Execute) => {
				let line = format_cmd(&transfer.cmd);
				transfer.cmd_sent = true;
				transfer.step = Step::AwaitReply;
				protocol.send_cmd(channel, &line)
			}
			Some(BCmd::Receive) => {
				let path = transfer.cmd.zfrom.clone();
				match spool.open_send(&path) {
					Ok((source, size)) => {
						transfer.source = Some(source);
						transfer.cbytes = Some(size);
						transfer.sending_file = true;
						transfer.cmd_sent = true;
						transfer.step = Step::SendFile;
						protocol.send_cmd(channel, &format!("RY 0{:o}", transfer.cmd.imode))
					}
					Err(err) => {
						warn!("failed to open {path:?} for a requested send: {err}");
						transfer.cmd_sent = true;
						protocol.send_cmd(channel, "RN2")
					}
				}
			}
			_ => {
				transfer.cmd_sent = true;
				Ok(true)
			}
		}
		.map(|_| ())
	}

	fn service_wait(&mut self, protocol: &mut dyn Protocol, channel: &mut dyn Channel, spool: &mut dyn Spool, outcome: WaitOutcome, grade_floor: char) -> Result<()> {
		if outcome == WaitOutcome::Idle {
			return Ok(());
		}

		while let Some(payload) = protocol.poll_payload() {
			match self.mux.deliver(&mut self.transfers, spool, &payload, None) {
				MuxEvent::HangupRequested => self.handle_hangup(protocol, channel, spool, grade_floor)?,
				MuxEvent::CommandDispatched(None) => self.handle_bare_reply(&payload, spool),
				MuxEvent::CommandDispatched(Some(_)) => {}
				MuxEvent::FileProgress(_) => {}
				MuxEvent::FileComplete(handle) => {
					if let Some(transfer) = self.transfers.get(handle) {
						let pseq = transfer.cmd.pseq;
						spool.did_work(pseq);
					}
					self.transfers.finish(handle);
				}
				MuxEvent::FileWriteFailed(_) => {
					warn!("aborting session after a failed write to a receive sink");
					self.fail_in_flight(spool);
					return Err(());
				}
				MuxEvent::Idle => {}
			}
		}
		Ok(())
	}

	/// A bare `Y`/`N`, or a reply line accumulated the same way a command
	/// is, satisfying the outstanding expectation on `send_ready`'s head.
	fn handle_bare_reply(&mut self, line: &[u8], spool: &mut dyn Spool) {
		let Ok(text) = std::str::from_utf8(line) else { return };
		let Some(code) = parse_reply(text) else { return };
		let Some(handle) = self.transfers.peek_front(Queue::SendReady) else { return };
		let Some(transfer) = self.transfers.get_mut(handle) else { return };

		match code {
			ReplyCode::SendOk => {
				transfer.sending_file = true;
				transfer.step = Step::SendFile;
			}
			ReplyCode::SendRefused(code) => self.finish_refused(handle, code, "send", spool),
			ReplyCode::ReceiveRefused(code) => self.finish_refused(handle, code, "receive", spool),
			ReplyCode::WildcardRefused => self.finish_refused(handle, None, "wildcard", spool),
			_ => {}
		}
	}

	/// Dispose of a transfer refused by the peer per §7 item 4: `SN7`/`SN2`/
	/// `RN2` are permanent — mail the requestor and let the job leave the
	/// queue via [`Spool::did_work`]. `SN4`/`SN6`/`RN6` are transient — the
	/// job stays queued for a later session, so `did_work` is not called.
	/// `SN8` ("already received") is silent success: the peer has the file
	/// from an earlier session and only the ack was lost, so nothing is
	/// mailed and the job still leaves the queue.
	fn finish_refused(&mut self, handle: collections::pool::Handle, code: Option<u8>, kind: &str, spool: &mut dyn Spool) {
		let Some(transfer) = self.transfers.get(handle) else { return };
		let pseq = transfer.cmd.pseq;
		let user = transfer.cmd.zuser.clone();
		let job = transfer.cmd.clone();

		match code {
			Some(2) | Some(7) => {
				spool.mail_refusal(&user, &job, &format!("{kind} refused by remote (permission or too large for this link)"));
				spool.did_work(pseq);
			}
			Some(4) | Some(6) => {
				warn!("{kind} transfer for pseq {pseq} refused transiently (code {code:?}), leaving queued for retry");
			}
			Some(8) => {
				spool.did_work(pseq);
			}
			_ => {
				warn!("{kind} transfer for pseq {pseq} refused with unrecognized code {code:?}, treating as permanent");
				spool.mail_refusal(&user, &job, &format!("{kind} refused by remote"));
				spool.did_work(pseq);
			}
		}

		if let Some(transfer) = self.transfers.get_mut(handle) {
			transfer.step = Step::Done;
		}
		self.transfers.finish(handle);
	}

	/// Master/slave switching on `H` (§4.5, §8 scenarios 5/6). The
	/// exchange is asymmetric by design, avoiding a simultaneous-hangup
	/// race.
	fn handle_hangup(&mut self, protocol: &mut dyn Protocol, channel: &mut dyn Channel, spool: &mut dyn Spool, grade_floor: char) -> Result<()> {
		if spool.has_work_at_grade(grade_floor) {
			protocol.send_cmd(channel, "HN")?;
			self.is_master = true;
			return Ok(());
		}

		protocol.send_cmd(channel, "HY")?;
		loop {
			match protocol.wait(channel) {
				Ok(WaitOutcome::Idle) => continue,
				Ok(_) => {
					let mut saw_hy = false;
					while let Some(payload) = protocol.poll_payload() {
						if let Ok(text) = std::str::from_utf8(&payload) {
							if text.trim_matches('\0') == "HY" {
								saw_hy = true;
							}
						}
					}
					if saw_hy {
						break;
					}
				}
				Err(()) => break,
			}
		}
		protocol.send_cmd(channel, "HY")?;
		protocol.shutdown(channel)?;
		self.hanging_up = true;
		self.done = true;
		Ok(())
	}

	/// Run the main loop to completion (§4.5 step 1-7, §5's single
	/// cooperative loop), then run the final physical-layer hangup
	/// handshake (§4.6). `step` already shuts the link protocol down
	/// itself before setting `done`, on every path that sets it.
	pub(crate) fn run_to_completion(&mut self, protocol: &mut dyn Protocol, channel: &mut dyn Channel, spool: &mut dyn Spool, grade_floor: char) -> Result<()> {
		loop {
			match self.step(protocol, channel, spool, grade_floor) {
				Ok(true) => continue,
				Ok(false) => break,
				Err(()) => return Err(()),
			}
		}
		if self.is_master {
			crate::session::hangup_caller(channel)
		} else {
			crate::session::hangup_callee(channel)
		}
	}

	fn fail_in_flight(&mut self, spool: &mut dyn Spool) {
		for queue in [Queue::LocalReady, Queue::RemoteReady, Queue::SendReady, Queue::ReceiveReady] {
			while let Some(h) = self.transfers.pop_front(queue) {
				if let Some(t) = self.transfers.get(h) {
					warn!("failing in-flight transfer for {:?} after protocol error", t.cmd.zfrom);
					spool.did_work(t.cmd.pseq);
				}
				self.transfers.finish(h);
			}
		}
	}
}

fn now() -> std::time::Instant {
	std::time::Instant::now()
}

/// One established UUCP connection (§5): the elected link protocol, the
/// transfer manager driving it, and the cancellation flags both poll.
/// Bundling these is what lets `Signals` be "a value on `Session`" rather
/// than a loose parameter threaded through every call.
pub struct Session {
	protocol: Box<dyn Protocol>,
	manager: Manager,
}

impl Session {
	pub fn new(protocol: Box<dyn Protocol>, is_master: bool, signals: Signals) -> Self {
		Self { protocol, manager: Manager::with_signals(is_master, signals) }
	}

	/// Drive this session's transfers to completion, then run the final
	/// hangup handshake. Consumes the session; a finished link is not
	/// reused.
	pub fn run(mut self, channel: &mut dyn Channel, spool: &mut dyn Spool, grade_floor: char) -> Result<()> {
		self.manager.run_to_completion(self.protocol.as_mut(), channel, spool, grade_floor)
	}
}

#[cfg(test)]
mod tests {
	use std::io;
	use std::path::{Path, PathBuf};

	use crate::cmd::BCmd;
	use crate::spool::ReceiveSink;

	use super::*;

	#[test]
	fn parses_send_and_receive_replies() {
		assert_eq!(parse_reply("SY 0644"), Some(ReplyCode::SendOk));
		assert_eq!(parse_reply("SN2"), Some(ReplyCode::SendRefused(Some(2))));
		assert_eq!(parse_reply("RY 0644"), Some(ReplyCode::ReceiveOk));
		assert_eq!(parse_reply("RN"), Some(ReplyCode::ReceiveRefused(None)));
	}

	#[test]
	fn parses_wildcard_and_completion_replies() {
		assert_eq!(parse_reply("XY"), Some(ReplyCode::WildcardOk));
		assert_eq!(parse_reply("XN"), Some(ReplyCode::WildcardRefused));
		assert_eq!(parse_reply("CY"), Some(ReplyCode::ReceiveComplete));
		assert_eq!(parse_reply("CN5"), Some(ReplyCode::ReceiveFailed));
	}

	#[test]
	fn manager_starts_idle_with_no_queued_work() {
		let m = Manager::new(true);
		assert!(!m.is_done());
	}

	#[derive(Default)]
	struct RecordingSpool {
		mailed: Vec<(String, u64)>,
		done: Vec<u64>,
	}

	impl Spool for RecordingSpool {
		fn next_work(&mut self, _grade: char) -> Option<Scmd> {
			None
		}
		fn has_work_at_grade(&self, _grade: char) -> bool {
			false
		}
		fn did_work(&mut self, pseq: u64) {
			self.done.push(pseq);
		}
		fn mail_refusal(&mut self, user: &str, job: &Scmd, _reason: &str) {
			self.mailed.push((user.to_string(), job.pseq));
		}
		fn open_send(&mut self, _path: &str) -> io::Result<(Box<dyn io::Read + Send>, u64)> {
			Err(io::Error::other("unused"))
		}
		fn open_receive(&mut self, _to: &str, _pseq: u64) -> io::Result<Box<dyn ReceiveSink>> {
			Err(io::Error::other("unused"))
		}
		fn move_to_final(&mut self, _temp: &Path, _final_path: &str) -> io::Result<()> {
			Ok(())
		}
		fn save_temp(&mut self, _pseq: u64) -> PathBuf {
			PathBuf::from("/tmp/x")
		}
		fn remember_reception(&mut self, _to: &str, _temp: &Path) {}
		fn forget_reception(&mut self, _to: &str, _temp: &Path) {}
	}

	fn queued_send(m: &mut Manager, pseq: u64, user: &str) -> collections::pool::Handle {
		let mut cmd = Scmd::new(BCmd::Send);
		cmd.pseq = pseq;
		cmd.zuser = user.to_string();
		m.transfers.spawn(Transfer::new(cmd, std::time::Instant::now()), Queue::SendReady)
	}

	#[test]
	fn permanent_refusal_codes_mail_and_delete_the_job() {
		for code in [2u8, 7] {
			let mut m = Manager::new(true);
			let mut spool = RecordingSpool::default();
			let h = queued_send(&mut m, 42, "alice");
			m.finish_refused(h, Some(code), "send", &mut spool);
			assert_eq!(spool.mailed, vec![("alice".to_string(), 42)]);
			assert_eq!(spool.done, vec![42]);
			assert!(m.transfers.get(h).is_none());
		}
	}

	#[test]
	fn transient_refusal_codes_leave_the_job_queued() {
		for code in [4u8, 6] {
			let mut m = Manager::new(true);
			let mut spool = RecordingSpool::default();
			let h = queued_send(&mut m, 7, "bob");
			m.finish_refused(h, Some(code), "send", &mut spool);
			assert!(spool.mailed.is_empty());
			assert!(spool.done.is_empty());
		}
	}

	#[test]
	fn already_received_code_is_silent_success() {
		let mut m = Manager::new(true);
		let mut spool = RecordingSpool::default();
		let h = queued_send(&mut m, 9, "carol");
		m.finish_refused(h, Some(8), "send", &mut spool);
		assert!(spool.mailed.is_empty());
		assert_eq!(spool.done, vec![9]);
	}

	#[test]
	fn bare_reply_dispatches_receive_refusal_the_same_way() {
		let mut m = Manager::new(true);
		let mut spool = RecordingSpool::default();
		let h = queued_send(&mut m, 11, "dave");
		m.handle_bare_reply(b"RN2", &mut spool);
		assert_eq!(spool.mailed, vec![("dave".to_string(), 11)]);
		assert_eq!(spool.done, vec![11]);
		assert!(m.transfers.get(h).is_none());
	}
}
