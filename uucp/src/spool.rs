//! The spool-layer trait contract the core consumes (§6 "Spool layer").
//! The spool directory's layout, locking, and job-ID naming are out of
//! scope (§1); this module only specifies the shape the core calls
//! through.

use std::io;
use std::path::PathBuf;

use crate::cmd::Scmd;

/// A writable destination for an inbound file, opened via
/// [`Spool::open_receive`] and finalized via [`Spool::move_to_final`].
pub trait ReceiveSink: io::Write {
	/// The temporary path this sink is writing to, for logging and for
	/// [`Spool::move_to_final`].
	fn temp_path(&self) -> &std::path::Path;
}

/// External collaborator owning the persistent work queue (§1 "out of
/// scope"; §6 lists its contract). The core never inspects spool-directory
/// layout, locking, or job-ID naming directly.
pub trait Spool {
	/// The next queued job at `grade` or better, if any (§4.5 step 1).
	fn next_work(&mut self, grade: char) -> Option<Scmd>;

	/// Whether any work exists at `grade` or better, without dequeuing it
	/// (used by master/slave switching, §4.5).
	fn has_work_at_grade(&self, grade: char) -> bool;

	/// Mark `pseq` as handled (succeeded, refused-and-mailed, or
	/// permanently failed) so it leaves the queue.
	fn did_work(&mut self, pseq: u64);

	/// Notify `user` that `job` was permanently refused by the peer, with
	/// `reason` a short human-readable explanation (§7 item 4: `SN7`/`SN2`/
	/// `RN2` "mail requestor, delete job"; §7 item 5: local spool errors
	/// "mail user, delete job"). The job is deleted separately via
	/// [`Spool::did_work`]; this only handles the notification side.
	fn mail_refusal(&mut self, user: &str, job: &Scmd, reason: &str);

	/// Open a local file for an outbound send, yielding its declared size.
	fn open_send(&mut self, path: &str) -> io::Result<(Box<dyn io::Read + Send>, u64)>;

	/// Open (create) a temporary destination for an inbound file.
	fn open_receive(&mut self, to: &str, pseq: u64) -> io::Result<Box<dyn ReceiveSink>>;

	/// Rename a completed temp file into its final spool/user-visible
	/// location (§3 I6, §4.4 step 4).
	fn move_to_final(&mut self, temp: &std::path::Path, final_path: &str) -> io::Result<()>;

	/// The temp path a send transfer should resume from if restarted
	/// (`pseq`'s saved partial state), or a fresh one.
	fn save_temp(&mut self, pseq: u64) -> PathBuf;

	/// Record that `to` now has a durable copy written under `temp`, so a
	/// lost CY/ack can be recognized as "already received" on retry (§7.4
	/// `SN8`).
	fn remember_reception(&mut self, to: &str, temp: &std::path::Path);

	/// Forget a previously-remembered reception once the peer has
	/// acknowledged it, or once its retention window elapses.
	fn forget_reception(&mut self, to: &str, temp: &std::path::Path);
}
