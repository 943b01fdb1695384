//! The command grammar parsed/formatted by `parse_cmd`/`format_cmd` (§6,
//! §3 `scmd`).

/// The leading letter of a command line (§3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BCmd {
	Send,
	Receive,
	Execute,
	Wildcard,
	Hangup,
	HangupYes,
	HangupNo,
}

impl BCmd {
	fn as_str(self) -> &'static str {
		match self {
			BCmd::Send => "S",
			BCmd::Receive => "R",
			BCmd::Execute => "E",
			BCmd::Wildcard => "X",
			BCmd::Hangup => "H",
			BCmd::HangupYes => "HY",
			BCmd::HangupNo => "HN",
		}
	}

	fn from_str(s: &str) -> Option<Self> {
		Some(match s {
			"S" => BCmd::Send,
			"R" => BCmd::Receive,
			"E" => BCmd::Execute,
			"X" => BCmd::Wildcard,
			"H" => BCmd::Hangup,
			"HY" => BCmd::HangupYes,
			"HN" => BCmd::HangupNo,
			_ => return None,
		})
	}
}

/// One queued work item (§3 `scmd`).
#[derive(Clone, Debug, Default)]
pub struct Scmd {
	pub bcmd: Option<BCmd>,
	pub zfrom: String,
	pub zto: String,
	pub zuser: String,
	pub zoptions: String,
	pub ztemp: String,
	pub imode: u32,
	pub znotify: String,
	pub cbytes: i64,
	pub zcmd: String,
	pub pseq: u64,
}

impl Scmd {
	pub fn new(bcmd: BCmd) -> Self {
		Self { bcmd: Some(bcmd), cbytes: -1, ..Default::default() }
	}
}

/// Parse one whitespace-separated command line per §6's grammar. Bare `H`/
/// `HY`/`HN`/`Y`/`N` commands carry only `bcmd`.
pub fn parse_cmd(line: &str) -> Option<Scmd> {
	let mut parts = line.split_whitespace();
	let head = parts.next()?;

	match head {
		"Y" | "N" => {
			return Some(Scmd { bcmd: None, zuser: head.to_string(), cbytes: -1, ..Default::default() });
		}
		"H" | "HY" | "HN" => {
			return Some(Scmd::new(BCmd::from_str(head)?));
		}
		_ => {}
	}

	let bcmd = BCmd::from_str(head)?;
	let mut cmd = Scmd::new(bcmd);

	cmd.zfrom = parts.next()?.to_string();
	cmd.zto = parts.next()?.to_string();
	cmd.zuser = parts.next()?.to_string();

	let options = parts.next()?;
	cmd.zoptions = options.strip_prefix('-')?.to_string();

	match bcmd {
		BCmd::Send | BCmd::Execute => {
			cmd.ztemp = parts.next()?.to_string();
			let mode = parts.next()?;
			cmd.imode = u32::from_str_radix(mode.strip_prefix('0')?, 8).ok()?;
			let notify = parts.next()?;
			cmd.znotify = if notify == "\"\"" { String::new() } else { notify.to_string() };

			if bcmd == BCmd::Execute {
				cmd.cbytes = parts.next()?.parse().ok()?;
				cmd.zcmd = parts.collect::<Vec<_>>().join(" ");
			} else if let Some(size) = parts.next() {
				cmd.cbytes = size.parse().ok()?;
			}
		}
		BCmd::Receive => {
			if let Some(size) = parts.next() {
				cmd.cbytes = size.parse().ok()?;
			}
		}
		BCmd::Wildcard => {}
		_ => unreachable!("bare H/HY/HN handled above"),
	}

	Some(cmd)
}

/// Format a command per the same grammar `parse_cmd` consumes (§8 L3).
pub fn format_cmd(cmd: &Scmd) -> String {
	let Some(bcmd) = cmd.bcmd else {
		return cmd.zuser.clone();
	};

	match bcmd {
		BCmd::Hangup | BCmd::HangupYes | BCmd::HangupNo => bcmd.as_str().to_string(),

		BCmd::Send | BCmd::Execute => {
			let notify = if cmd.znotify.is_empty() { "\"\"".to_string() } else { cmd.znotify.clone() };
			let mut s = format!("{} {} {} {} -{} {} 0{:o} {}", bcmd.as_str(), cmd.zfrom, cmd.zto, cmd.zuser, cmd.zoptions, cmd.ztemp, cmd.imode, notify);
			if bcmd == BCmd::Execute {
				s.push_str(&format!(" {}", cmd.cbytes));
				if !cmd.zcmd.is_empty() {
					s.push(' ');
					s.push_str(&cmd.zcmd);
				}
			} else if cmd.cbytes >= 0 {
				s.push_str(&format!(" {}", cmd.cbytes));
			}
			s
		}

		BCmd::Receive => {
			let mut s = format!("R {} {} {} -{}", cmd.zfrom, cmd.zto, cmd.zuser, cmd.zoptions);
			if cmd.cbytes >= 0 {
				s.push_str(&format!(" {}", cmd.cbytes));
			}
			s
		}

		BCmd::Wildcard => format!("X {} {} {} -{}", cmd.zfrom, cmd.zto, cmd.zuser, cmd.zoptions),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn send_round_trips() {
		let line = "S /tmp/a /spool/a root -C D.0 0644 \"\" 5";
		let cmd = parse_cmd(line).unwrap();
		assert_eq!(cmd.bcmd, Some(BCmd::Send));
		assert_eq!(cmd.imode, 0o644);
		assert_eq!(cmd.cbytes, 5);
		assert_eq!(format_cmd(&cmd), line);
	}

	#[test]
	fn receive_without_size_round_trips() {
		let line = "R /remote/b /local/b root -f";
		let cmd = parse_cmd(line).unwrap();
		assert_eq!(cmd.cbytes, -1);
		assert_eq!(format_cmd(&cmd), line);
	}

	#[test]
	fn execute_carries_trailing_command_text() {
		let line = "E /tmp/a /spool/a root -C D.0 0644 \"\" 5 rnews";
		let cmd = parse_cmd(line).unwrap();
		assert_eq!(cmd.zcmd, "rnews");
		assert_eq!(format_cmd(&cmd), line);
	}

	#[test]
	fn bare_hangup_commands_round_trip() {
		for line in ["H", "HY", "HN"] {
			let cmd = parse_cmd(line).unwrap();
			assert_eq!(format_cmd(&cmd), line);
		}
	}
}
