//! The `stransfer` record (§3) and its pool and intrusive queues.

use std::io::Read;
use std::time::Instant;

use collections::pool::{Handle, Pool};

use crate::cmd::Scmd;
use crate::spool::ReceiveSink;

/// Which of the four queues (§4.5) a [`Transfer`] currently sits on; a
/// transfer is on at most one at any instant (§3 I4, §8 I4).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Queue {
	LocalReady,
	RemoteReady,
	SendReady,
	ReceiveReady,
}

/// The next step a [`Transfer`]'s state machine will take, standing in for
/// the reference's `psendfn`/`precfn` hook pair (§9 Design Notes:
/// "function-pointer state machines").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Step {
	/// Waiting for the peer's reply to a just-sent command.
	AwaitReply,
	/// Actively streaming file bytes (sender side).
	SendFile,
	/// Actively accepting file bytes (receiver side).
	ReceiveFile,
	/// The transfer's terminal callback has not yet run.
	Finish,
	/// The terminal callback has run; the transfer may be freed.
	Done,
}

/// A live in-flight instance of a queued command (§3 `stransfer`).
pub struct Transfer {
	pub cmd: Scmd,
	pub queue: Option<Queue>,
	pub step: Step,

	/// File position; bytes at or below this are confirmed transferred.
	pub ipos: u64,
	/// Declared/negotiated byte count, or `None` if unknown.
	pub cbytes: Option<u64>,

	/// 0 = unassigned (§3 invariant: at most one transfer holds any given
	/// local/remote channel id at a time).
	pub ilocal: u8,
	pub iremote: u8,

	pub sending_file: bool,
	pub receiving_file: bool,

	/// Open destination for an inbound file, once `open_receive` has run.
	pub sink: Option<Box<dyn ReceiveSink>>,
	/// Open source for an outbound file, once `open_send` has run.
	pub source: Option<Box<dyn Read + Send>>,

	pub started_at: Instant,
	pub attempt: u32,

	/// Whether this transfer's command line (or reply) has already been
	/// written to the channel; `advance` uses this to send it exactly
	/// once.
	pub cmd_sent: bool,
}

impl Transfer {
	pub fn new(cmd: Scmd, now: Instant) -> Self {
		let cbytes = (cmd.cbytes >= 0).then_some(cmd.cbytes as u64);
		Self {
			cmd,
			queue: None,
			step: Step::AwaitReply,
			ipos: 0,
			cbytes,
			ilocal: 0,
			iremote: 0,
			sending_file: false,
			receiving_file: false,
			sink: None,
			source: None,
			started_at: now,
			attempt: 0,
			cmd_sent: false,
		}
	}
}

/// The transfer manager's pool plus its four intrusive queues (§4.5),
/// modeled as `Vec<Handle>` FIFOs over a shared [`Pool`] rather than raw
/// linked-list pointers.
#[derive(Default)]
pub struct Transfers {
	pool: Pool<Transfer>,
	local_ready: Vec<Handle>,
	remote_ready: Vec<Handle>,
	send_ready: Vec<Handle>,
	receive_ready: Vec<Handle>,
}

impl Transfers {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, h: Handle) -> Option<&Transfer> {
		self.pool.get(h)
	}

	pub fn get_mut(&mut self, h: Handle) -> Option<&mut Transfer> {
		self.pool.get_mut(h)
	}

	fn queue_mut(&mut self, q: Queue) -> &mut Vec<Handle> {
		match q {
			Queue::LocalReady => &mut self.local_ready,
			Queue::RemoteReady => &mut self.remote_ready,
			Queue::SendReady => &mut self.send_ready,
			Queue::ReceiveReady => &mut self.receive_ready,
		}
	}

	pub fn queue_len(&self, q: Queue) -> usize {
		match q {
			Queue::LocalReady => self.local_ready.len(),
			Queue::RemoteReady => self.remote_ready.len(),
			Queue::SendReady => self.send_ready.len(),
			Queue::ReceiveReady => self.receive_ready.len(),
		}
	}

	pub fn all_queues_empty(&self) -> bool {
		self.local_ready.is_empty() && self.remote_ready.is_empty() && self.send_ready.is_empty() && self.receive_ready.is_empty()
	}

	/// Insert a new transfer onto `queue`, returning its handle.
	pub fn spawn(&mut self, transfer: Transfer, queue: Queue) -> Handle {
		let mut transfer = transfer;
		transfer.queue = Some(queue);
		let handle = self.pool.insert(transfer);
		self.queue_mut(queue).push(handle);
		handle
	}

	/// Move `handle` from whatever queue it is on (if any) to `queue`. A
	/// transfer sits on at most one queue at any instant (§3 I4).
	pub fn move_to(&mut self, handle: Handle, queue: Queue) {
		if let Some(prev) = self.get(handle).and_then(|t| t.queue) {
			self.queue_mut(prev).retain(|&h| h != handle);
		}
		if let Some(t) = self.get_mut(handle) {
			t.queue = Some(queue);
		}
		self.queue_mut(queue).push(handle);
	}

	/// Pop the front of `queue`, without removing the transfer from the
	/// pool.
	pub fn pop_front(&mut self, queue: Queue) -> Option<Handle> {
		let q = self.queue_mut(queue);
		if q.is_empty() {
			None
		} else {
			Some(q.remove(0))
		}
	}

	pub fn peek_front(&self, queue: Queue) -> Option<Handle> {
		match queue {
			Queue::LocalReady => self.local_ready.first().copied(),
			Queue::RemoteReady => self.remote_ready.first().copied(),
			Queue::SendReady => self.send_ready.first().copied(),
			Queue::ReceiveReady => self.receive_ready.first().copied(),
		}
	}

	/// Remove `handle` entirely once its terminal callback has run,
	/// freeing its slot for reuse (§3 "freed only after the terminal
	/// callback returns").
	pub fn finish(&mut self, handle: Handle) -> Option<Transfer> {
		if let Some(t) = self.get(handle) {
			if let Some(q) = t.queue {
				self.queue_mut(q).retain(|&h| h != handle);
			}
		}
		self.pool.remove(handle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cmd::BCmd;

	fn dummy(now: Instant) -> Transfer {
		Transfer::new(Scmd::new(BCmd::Send), now)
	}

	#[test]
	fn transfer_sits_on_at_most_one_queue() {
		let mut t = Transfers::new();
		let now = Instant::now();
		let h = t.spawn(dummy(now), Queue::LocalReady);
		assert_eq!(t.queue_len(Queue::LocalReady), 1);

		t.move_to(h, Queue::SendReady);
		assert_eq!(t.queue_len(Queue::LocalReady), 0);
		assert_eq!(t.queue_len(Queue::SendReady), 1);
	}

	#[test]
	fn finish_frees_the_slot_for_reuse() {
		let mut t = Transfers::new();
		let now = Instant::now();
		let h = t.spawn(dummy(now), Queue::RemoteReady);
		t.finish(h);
		assert!(t.get(h).is_none());
		assert_eq!(t.queue_len(Queue::RemoteReady), 0);

		let h2 = t.spawn(dummy(now), Queue::RemoteReady);
		assert!(t.get(h2).is_some());
	}
}
