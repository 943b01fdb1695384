//! Grade ordering and timetable parsing (§4.5 "Grades",
//! `btime_low_grade`).
//!
//! Grades order `0`..`9`, `A`..`Z`, `a`..`z` from highest to lowest
//! priority; comparing the raw ASCII values happens to give exactly this
//! order already since `'0'..'9' < 'A'..'Z' < 'a'..'z'`.
//!
//! A timetable entry's grade is a *floor*: it names the lowest-priority
//! grade still allowed to go out during that window. Per §8's boundary
//! behavior, a floor of `'z'` (the lowest grade there is) permits only
//! jobs graded `'z'`, while a floor of `'0'` (the highest grade) permits
//! every job — the floor says "this priority or worse is acceptable
//! right now", and `'0'` is worse than nothing, so everything qualifies.

/// Whether a job graded `job_grade` may be sent given the current floor
/// `allowed_grade` (§8 boundary: `'z'` permits only itself, `'0'` permits
/// all).
pub fn grade_permitted(job_grade: char, allowed_grade: char) -> bool {
	job_grade >= allowed_grade
}

/// One entry of a grade timetable: a day-of-week/time-of-day window during
/// which `grade` is the lowest grade allowed, with an optional
/// retry-minutes override.
#[derive(Clone, Debug)]
pub struct TimetableEntry {
	pub days: Vec<Day>,
	pub start: u16,
	pub end: u16,
	pub grade: char,
	pub retry_minutes: Option<u32>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Day {
	Su,
	Mo,
	Tu,
	We,
	Th,
	Fr,
	Sa,
	Any,
	Wk,
}

impl Day {
	fn from_str(s: &str) -> Option<Self> {
		Some(match s {
			"Su" => Day::Su,
			"Mo" => Day::Mo,
			"Tu" => Day::Tu,
			"We" => Day::We,
			"Th" => Day::Th,
			"Fr" => Day::Fr,
			"Sa" => Day::Sa,
			"Any" => Day::Any,
			"Wk" => Day::Wk,
			_ => return None,
		})
	}

	/// Whether this token (possibly the `Wk` weekday shorthand) covers
	/// `today`.
	pub fn matches(self, today: Day) -> bool {
		match self {
			Day::Any => true,
			Day::Wk => matches!(today, Day::Mo | Day::Tu | Day::We | Day::Th | Day::Fr),
			other => other == today,
		}
	}
}

/// Parse one comma-separated timetable clause, e.g.
/// `Wk1705-0755,Sa,Su;120` (`;retry-minutes` optional, §4.5/§7).
pub fn parse_timetable(spec: &str, grade: char) -> Option<TimetableEntry> {
	let (body, retry) = match spec.split_once(';') {
		Some((b, r)) => (b, Some(r.parse().ok()?)),
		None => (spec, None),
	};

	let mut days = Vec::new();
	let mut start = 0u16;
	let mut end = 2359u16;

	for token in body.split(',') {
		let split_at = token.find(|c: char| c.is_ascii_digit()).unwrap_or(token.len());
		let (day_part, time_part) = token.split_at(split_at);
		if let Some(day) = Day::from_str(day_part) {
			days.push(day);
		}
		if let Some((s, e)) = time_part.split_once('-') {
			start = s.parse().ok()?;
			end = e.parse().ok()?;
		}
	}

	if days.is_empty() {
		days.push(Day::Any);
	}

	Some(TimetableEntry { days, start, end, grade, retry_minutes: retry })
}

/// Find the lowest grade permitted at `(today, hhmm)` across a set of
/// timetable entries (`btime_low_grade`). A window's `start..end` may wrap
/// past midnight (`start > end`). Absent any matching window, every grade
/// is permitted — equivalent to a floor of `'0'`.
pub fn low_grade_at(entries: &[TimetableEntry], today: Day, hhmm: u16) -> char {
	let mut best = '0';
	for entry in entries {
		let in_window = if entry.start <= entry.end { hhmm >= entry.start && hhmm < entry.end } else { hhmm >= entry.start || hhmm < entry.end };
		if in_window && entry.days.iter().any(|d| d.matches(today)) && entry.grade > best {
			best = entry.grade;
		}
	}
	best
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lowest_grade_permits_only_itself() {
		assert!(grade_permitted('z', 'z'));
		assert!(!grade_permitted('y', 'z'));
		assert!(!grade_permitted('0', 'z'));
	}

	#[test]
	fn highest_grade_permits_everything() {
		for g in ['0', '5', 'A', 'z'] {
			assert!(grade_permitted(g, '0'));
		}
	}

	#[test]
	fn timetable_window_parses_and_matches() {
		let entry = parse_timetable("Wk1705-0755", 'c').unwrap();
		assert_eq!(entry.start, 1705);
		assert_eq!(entry.end, 755);
		assert!(entry.days.iter().any(|d| *d == Day::Wk));

		// wraps past midnight: 1705..2400 and 0000..0755 both count as "in window"
		assert_eq!(low_grade_at(std::slice::from_ref(&entry), Day::Mo, 2000), 'c');
		assert_eq!(low_grade_at(std::slice::from_ref(&entry), Day::Sa, 2000), '0', "Saturday isn't in Wk, so no window applies and everything is allowed");
	}

	#[test]
	fn retry_minutes_suffix_parses() {
		let entry = parse_timetable("Any0000-2359;120", 'b').unwrap();
		assert_eq!(entry.retry_minutes, Some(120));
	}
}
