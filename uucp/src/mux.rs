//! The framing multiplexer (§4.4): routes payload bytes delivered by the
//! link protocol either into the pending-command accumulator or into a
//! receiving transfer's file sink.

use std::io::Write;

use collections::pool::Handle;
use log::warn;

use crate::cmd::{parse_cmd, BCmd, Scmd};
use crate::spool::Spool;
use crate::transfer::{Queue, Step, Transfer, Transfers};

/// What happened as a result of routing one payload (§4.4); the transfer
/// manager's main loop acts on this.
#[derive(Debug)]
pub enum MuxEvent {
	/// A full command line was parsed and dispatched; `None` means it was
	/// a bare acknowledgement (`HY`/`HN`/`N`) with no new transfer.
	CommandDispatched(Option<Handle>),
	/// A hangup request (`H`) arrived; the manager must decide
	/// HY/HN per §4.5.
	HangupRequested,
	/// A file payload (possibly zero-length, i.e. EOF) was written to the
	/// named receive transfer.
	FileProgress(Handle),
	/// A file transfer completed: moved to final storage and CY/CN5
	/// queued.
	FileComplete(Handle),
	/// A write to the receive sink failed (§4.4 step 3: "any short write
	/// aborts the session"). The caller must treat this as a hard session
	/// failure, the same as a `Protocol::wait` error, not continue as if
	/// the bytes landed.
	FileWriteFailed(Handle),
	/// Nothing actionable yet (command still accumulating).
	Idle,
}

#[derive(Default)]
pub struct Multiplexer {
	cmd_buf: Vec<u8>,
	/// The receive transfer currently expecting file bytes on the sole
	/// logical channel, for protocols without explicit channel ids.
	active_receive: Option<Handle>,
}

impl Multiplexer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_active_receive(&mut self, handle: Option<Handle>) {
		self.active_receive = handle;
	}

	/// Route one payload delivered by the link protocol (§4.4). `channel`
	/// is the explicit remote channel id if the protocol supplies one
	/// (`None` for 'g'/'t'/'f', which are single-channel).
	pub fn deliver(&mut self, transfers: &mut Transfers, spool: &mut dyn Spool, payload: &[u8], _channel: Option<u8>) -> MuxEvent {
		if let Some(handle) = self.active_receive.filter(|h| transfers.get(*h).is_some_and(|t| t.receiving_file)) {
			return self.write_to_file(transfers, spool, handle, payload);
		}

		self.accumulate_command(transfers, spool, payload)
	}

	fn write_to_file(&mut self, transfers: &mut Transfers, spool: &mut dyn Spool, handle: Handle, payload: &[u8]) -> MuxEvent {
		if payload.is_empty() {
			return self.complete_file(transfers, spool, handle);
		}

		let Some(transfer) = transfers.get_mut(handle) else {
			warn!("file payload delivered for a transfer that no longer exists");
			return MuxEvent::Idle;
		};

		let Some(sink) = transfer.sink.as_mut() else {
			warn!("file payload delivered before open_receive ran");
			return MuxEvent::Idle;
		};

		match sink.write_all(payload) {
			Ok(()) => {
				transfer.ipos += payload.len() as u64;
				MuxEvent::FileProgress(handle)
			}
			Err(err) => {
				// A short write is treated as fatal (§4.4 step 3): the
				// remote will otherwise believe we hold the file and
				// overwrite ours on a later attempt, so both sides must
				// lose the accounting rather than silently diverge.
				warn!("short write while receiving file, aborting session: {err}");
				MuxEvent::FileWriteFailed(handle)
			}
		}
	}

	fn complete_file(&mut self, transfers: &mut Transfers, spool: &mut dyn Spool, handle: Handle) -> MuxEvent {
		self.active_receive = None;

		let Some(transfer) = transfers.get_mut(handle) else {
			return MuxEvent::Idle;
		};
		transfer.receiving_file = false;
		transfer.step = Step::Finish;

		let Some(sink) = transfer.sink.take() else {
			warn!("file completed with no sink open");
			return MuxEvent::FileComplete(handle);
		};
		let temp = sink.temp_path().to_path_buf();
		drop(sink);

		let final_path = transfer.cmd.zto.clone();

		match spool.move_to_final(&temp, &final_path) {
			Ok(()) => {
				spool.remember_reception(&final_path, &temp);
			}
			Err(err) => {
				warn!("failed to move received file to final location: {err}");
			}
		}

		MuxEvent::FileComplete(handle)
	}

	/// Accumulate bytes into the pending-command buffer, dispatching on
	/// the first embedded NUL (§4.4 step 2).
	fn accumulate_command(&mut self, transfers: &mut Transfers, spool: &mut dyn Spool, payload: &[u8]) -> MuxEvent {
		for (i, &b) in payload.iter().enumerate() {
			if b == 0 {
				self.cmd_buf.extend_from_slice(&payload[..i]);
				let line = String::from_utf8_lossy(&self.cmd_buf).into_owned();
				self.cmd_buf.clear();
				self.cmd_buf.extend_from_slice(&payload[i + 1..]);
				return self.dispatch(transfers, spool, &line);
			}
		}
		self.cmd_buf.extend_from_slice(payload);
		MuxEvent::Idle
	}

	fn dispatch(&mut self, transfers: &mut Transfers, spool: &mut dyn Spool, line: &str) -> MuxEvent {
		let Some(cmd) = parse_cmd(line) else {
			warn!("unparseable command line: {line:?}");
			return MuxEvent::Idle;
		};

		match cmd.bcmd {
			Some(BCmd::Send) | Some(BCmd::Execute) => MuxEvent::CommandDispatched(Some(self.accept_send(transfers, spool, cmd))),
			Some(BCmd::Receive) => MuxEvent::CommandDispatched(Some(self.accept_receive(transfers, cmd))),
			Some(BCmd::Wildcard) => MuxEvent::CommandDispatched(Some(transfers.spawn(Transfer::new(cmd, now()), Queue::LocalReady))),
			Some(BCmd::Hangup) => MuxEvent::HangupRequested,
			Some(BCmd::HangupYes) | Some(BCmd::HangupNo) => MuxEvent::CommandDispatched(None),
			None => MuxEvent::CommandDispatched(None), // bare Y/N satisfying an outstanding expectation
		}
	}

	fn accept_send(&mut self, transfers: &mut Transfers, spool: &mut dyn Spool, cmd: Scmd) -> Handle {
		let pseq = cmd.pseq;
		let to = cmd.zto.clone();
		let mut transfer = Transfer::new(cmd, now());
		transfer.receiving_file = true;
		match spool.open_receive(&to, pseq) {
			Ok(sink) => transfer.sink = Some(sink),
			Err(err) => warn!("failed to open receive destination for {to:?}: {err}"),
		}
		let handle = transfers.spawn(transfer, Queue::ReceiveReady);
		self.active_receive = Some(handle);
		handle
	}

	fn accept_receive(&mut self, transfers: &mut Transfers, cmd: Scmd) -> Handle {
		let mut transfer = Transfer::new(cmd, now());
		transfer.sending_file = true;
		transfers.spawn(transfer, Queue::SendReady)
	}
}

fn now() -> std::time::Instant {
	std::time::Instant::now()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::spool::ReceiveSink;
	use std::io;
	use std::path::{Path, PathBuf};

	struct FakeSpool;
	struct FakeSink(PathBuf);
	impl io::Write for FakeSink {
		fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
			Ok(buf.len())
		}
		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}
	impl ReceiveSink for FakeSink {
		fn temp_path(&self) -> &Path {
			&self.0
		}
	}
	impl Spool for FakeSpool {
		fn next_work(&mut self, _grade: char) -> Option<Scmd> {
			None
		}
		fn has_work_at_grade(&self, _grade: char) -> bool {
			false
		}
		fn did_work(&mut self, _pseq: u64) {}
		fn mail_refusal(&mut self, _user: &str, _job: &Scmd, _reason: &str) {}
		fn open_send(&mut self, _path: &str) -> io::Result<(Box<dyn io::Read + Send>, u64)> {
			Err(io::Error::other("unused"))
		}
		fn open_receive(&mut self, _to: &str, _pseq: u64) -> io::Result<Box<dyn ReceiveSink>> {
			Ok(Box::new(FakeSink(PathBuf::from("/tmp/x"))))
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

	#[test]
	fn command_accumulates_across_calls_until_nul() {
		let mut mux = Multiplexer::new();
		let mut transfers = Transfers::new();
		let mut spool = FakeSpool;

		assert!(matches!(mux.deliver(&mut transfers, &mut spool, b"S /a /b user -C te", None), MuxEvent::Idle));
		let event = mux.deliver(&mut transfers, &mut spool, b"mp 0644 \"\" 5\0", None);
		assert!(matches!(event, MuxEvent::CommandDispatched(Some(_))));
	}

	#[test]
	fn zero_length_payload_completes_receive() {
		let mut mux = Multiplexer::new();
		let mut transfers = Transfers::new();
		let mut spool = FakeSpool;

		let line = b"S /a /b user -C temp 0644 \"\" 0\0";
		mux.deliver(&mut transfers, &mut spool, line, None);

		let event = mux.deliver(&mut transfers, &mut spool, b"", None);
		assert!(matches!(event, MuxEvent::FileComplete(_)));
	}

	struct FailingSink(PathBuf);
	impl io::Write for FailingSink {
		fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
			Err(io::Error::other("disk full"))
		}
		fn flush(&mut self) -> io::Result<()> {
			Ok(())
		}
	}
	impl ReceiveSink for FailingSink {
		fn temp_path(&self) -> &Path {
			&self.0
		}
	}
	struct FailingSpool;
	impl Spool for FailingSpool {
		fn next_work(&mut self, _grade: char) -> Option<Scmd> {
			None
		}
		fn has_work_at_grade(&self, _grade: char) -> bool {
			false
		}
		fn did_work(&mut self, _pseq: u64) {}
		fn mail_refusal(&mut self, _user: &str, _job: &Scmd, _reason: &str) {}
		fn open_send(&mut self, _path: &str) -> io::Result<(Box<dyn io::Read + Send>, u64)> {
			Err(io::Error::other("unused"))
		}
		fn open_receive(&mut self, _to: &str, _pseq: u64) -> io::Result<Box<dyn ReceiveSink>> {
			Ok(Box::new(FailingSink(PathBuf::from("/tmp/x"))))
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

	#[test]
	fn sink_write_failure_is_reported_as_fatal_not_progress() {
		let mut mux = Multiplexer::new();
		let mut transfers = Transfers::new();
		let mut spool = FailingSpool;

		let line = b"S /a /b user -C temp 0644 \"\" 5\0";
		mux.deliver(&mut transfers, &mut spool, line, None);

		let event = mux.deliver(&mut transfers, &mut spool, b"hello", None);
		assert!(matches!(event, MuxEvent::FileWriteFailed(_)), "expected a fatal write failure, got {event:?}");
	}
}
