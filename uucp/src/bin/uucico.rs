//! Driver binary: installs the logger, reads a handful of flags, and
//! drives one UUCP session over a TCP connection.
//!
//! Flag parsing is done by hand rather than pulling in an argument-parsing
//! crate: `uucico` only ever takes a handful of single-letter flags, the
//! same shape the reference implementation's own getopt-based parsing
//! has.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use channel::unix::FdChannel;
use log::{error, info, warn, LevelFilter};

use uucp::cmd::Scmd;
use uucp::{answer, dial, AnswerOutcome, DialOutcome, PeerConfig, ReceiveSink, Session, Signals, Spool};

struct FileSink {
	file: File,
	path: PathBuf,
}

impl io::Write for FileSink {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.file.write(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.file.flush()
	}
}

impl ReceiveSink for FileSink {
	fn temp_path(&self) -> &Path {
		&self.path
	}
}

/// Enough file plumbing under a root directory to run a real session;
/// the persistent work-queue format (job naming, locking, directory
/// layout) is out of scope and left to a real front end.
struct FsSpool {
	root: PathBuf,
	remembered: HashSet<(String, PathBuf)>,
	next_temp: u64,
}

impl FsSpool {
	fn new(root: PathBuf) -> io::Result<Self> {
		fs::create_dir_all(root.join(".tmp"))?;
		Ok(Self { root, remembered: HashSet::new(), next_temp: 0 })
	}
}

impl Spool for FsSpool {
	fn next_work(&mut self, _grade: char) -> Option<Scmd> {
		None
	}

	fn has_work_at_grade(&self, _grade: char) -> bool {
		false
	}

	fn did_work(&mut self, _pseq: u64) {}

	fn mail_refusal(&mut self, user: &str, job: &Scmd, reason: &str) {
		// A real front end would hand this to `/usr/bin/mail` or queue it as
		// the local MTA's own job; this one just logs it loudly enough that
		// an operator reading uucico's output won't miss a dropped transfer.
		warn!("mailing {user}: {:?} -> {:?} refused: {reason}", job.zfrom, job.zto);
	}

	fn open_send(&mut self, path: &str) -> io::Result<(Box<dyn io::Read + Send>, u64)> {
		let file = File::open(path)?;
		let size = file.metadata()?.len();
		Ok((Box::new(file), size))
	}

	fn open_receive(&mut self, _to: &str, _pseq: u64) -> io::Result<Box<dyn ReceiveSink>> {
		let path = self.root.join(".tmp").join(format!("uucico.{}", self.next_temp));
		self.next_temp += 1;
		let file = File::create(&path)?;
		Ok(Box::new(FileSink { file, path }))
	}

	fn move_to_final(&mut self, temp: &Path, final_path: &str) -> io::Result<()> {
		let dest = self.root.join(final_path.trim_start_matches('/'));
		if let Some(parent) = dest.parent() {
			fs::create_dir_all(parent)?;
		}
		fs::rename(temp, dest)
	}

	fn save_temp(&mut self, pseq: u64) -> PathBuf {
		self.root.join(".tmp").join(format!("uucico.resume.{pseq}"))
	}

	fn remember_reception(&mut self, to: &str, temp: &Path) {
		self.remembered.insert((to.to_string(), temp.to_path_buf()));
	}

	fn forget_reception(&mut self, to: &str, temp: &Path) {
		self.remembered.remove(&(to.to_string(), temp.to_path_buf()));
	}
}

struct Options {
	is_caller: bool,
	self_name: String,
	peer: Option<String>,
	listen_addr: String,
	spool_root: PathBuf,
	debug: LevelFilter,
}

impl Options {
	fn parse() -> Self {
		let mut opts = Options {
			is_caller: false,
			self_name: "local".to_string(),
			peer: None,
			listen_addr: "0.0.0.0:6000".to_string(),
			spool_root: PathBuf::from("/var/spool/uucico"),
			debug: LevelFilter::Info,
		};

		for arg in std::env::args().skip(1) {
			if let Some(name) = arg.strip_prefix("-s") {
				opts.is_caller = true;
				opts.peer = Some(name.to_string());
			} else if arg == "-r1" {
				opts.is_caller = true;
			} else if let Some(level) = arg.strip_prefix("-x") {
				opts.debug = level.parse().unwrap_or(LevelFilter::Info);
			} else if let Some(addr) = arg.strip_prefix("-l") {
				opts.listen_addr = addr.to_string();
			} else if let Some(name) = arg.strip_prefix("-n") {
				opts.self_name = name.to_string();
			} else if let Some(root) = arg.strip_prefix("-d") {
				opts.spool_root = PathBuf::from(root);
			} else {
				warn!("ignoring unrecognized argument: {arg}");
			}
		}

		opts
	}
}

fn main() -> ExitCode {
	let opts = Options::parse();

	log::set_max_level(opts.debug);
	if log::set_boxed_logger(Box::new(channel::logger::Logger)).is_err() {
		eprintln!("logger already installed");
	}

	let config = PeerConfig { protocol_letters: vec!['g', 't', 'f', 'e'], reliability: codec::Reliability::all(), size_negotiation: true, ..PeerConfig::new() };

	let mut spool = match FsSpool::new(opts.spool_root.clone()) {
		Ok(s) => s,
		Err(err) => {
			error!("failed to initialize spool root {:?}: {err}", opts.spool_root);
			return ExitCode::FAILURE;
		}
	};

	let stream = if opts.is_caller {
		let Some(peer) = opts.peer.as_deref() else {
			error!("-r1 requires -s<host:port>");
			return ExitCode::FAILURE;
		};
		match TcpStream::connect(peer) {
			Ok(s) => s,
			Err(err) => {
				error!("dial to {peer} failed: {err}");
				return ExitCode::FAILURE;
			}
		}
	} else {
		let listener = match TcpListener::bind(&opts.listen_addr) {
			Ok(l) => l,
			Err(err) => {
				error!("bind {} failed: {err}", opts.listen_addr);
				return ExitCode::FAILURE;
			}
		};
		match listener.accept() {
			Ok((s, addr)) => {
				info!("accepted connection from {addr}");
				s
			}
			Err(err) => {
				error!("accept failed: {err}");
				return ExitCode::FAILURE;
			}
		}
	};

	let mut channel = FdChannel::new(stream);

	let (mut protocol, is_master) = if opts.is_caller {
		match dial(&mut channel, &opts.self_name, opts.peer.as_deref(), &config) {
			Ok(DialOutcome::Connected { protocol, .. }) => (protocol, true),
			Ok(DialOutcome::CallBack) => {
				info!("callee asked to call back; ending this session");
				return ExitCode::SUCCESS;
			}
			Ok(DialOutcome::Refused(reason)) => {
				warn!("call refused: {reason:?}");
				return ExitCode::FAILURE;
			}
			Err(()) => return ExitCode::FAILURE,
		}
	} else {
		match answer(&mut channel, &opts.self_name, &config) {
			Ok(AnswerOutcome::Connected { protocol, .. }) => (protocol, false),
			Ok(AnswerOutcome::Refused(reason)) => {
				warn!("refused incoming call: {reason:?}");
				return ExitCode::FAILURE;
			}
			Err(()) => return ExitCode::FAILURE,
		}
	};

	let signals = Signals::new();
	if let Err(err) = signals.install() {
		warn!("failed to install signal handlers, quit/hangup requests will be ignored: {err}");
	}

	let session = Session::new(protocol, is_master, signals);
	if session.run(&mut channel, &mut spool, '0').is_err() {
		error!("session ended with a protocol error");
		return ExitCode::FAILURE;
	}

	ExitCode::SUCCESS
}
