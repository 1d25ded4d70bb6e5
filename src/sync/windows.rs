//! Window planning over the `validFromDate` axis.
//!
//! A sweep walks an unbounded time axis in bounded sub-ranges; the planner yields one
//! inclusive-second window per step, clamped at the present.

// crates.io
use chrono::{Datelike, TimeZone};
// self
use crate::_prelude::*;

/// Timestamp format used on the wire and in the checkpoint, always UTC.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Width of the sub-ranges a sweep is broken into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interval {
	/// One calendar day per window.
	Daily,
	/// One calendar month per window.
	Monthly,
	/// One calendar year per window; the default for a full sweep.
	Yearly,
}
impl Interval {
	/// Parse an interval selector; `full` selects yearly windows.
	pub fn parse(raw: &str) -> Option<Self> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"daily" => Some(Interval::Daily),
			"monthly" => Some(Interval::Monthly),
			"yearly" | "full" => Some(Interval::Yearly),
			_ => None,
		}
	}

	/// Canonical selector name.
	pub fn as_str(&self) -> &'static str {
		match self {
			Interval::Daily => "daily",
			Interval::Monthly => "monthly",
			Interval::Yearly => "yearly",
		}
	}
}
impl std::fmt::Display for Interval {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}
impl std::str::FromStr for Interval {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		Self::parse(raw).ok_or_else(|| Error::Validation {
			field: "interval",
			reason: format!("Unknown interval '{raw}'; expected daily, monthly, or yearly."),
		})
	}
}

/// One bounded sub-range of the sweep, plus the cursor for the following step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
	/// Inclusive lower bound sent upstream.
	pub start: DateTime<Utc>,
	/// Inclusive upper bound sent upstream, clamped at the planning instant.
	pub end: DateTime<Utc>,
	/// Start of the next window.
	pub next_cursor: DateTime<Utc>,
}

/// Plan the window containing `cursor`, or `None` once the cursor passes `now`.
pub fn plan_window(cursor: DateTime<Utc>, interval: Interval, now: DateTime<Utc>) -> Option<Window> {
	if cursor > now {
		return None;
	}

	let (end, next_cursor) = match interval {
		Interval::Daily => {
			let end = cursor.date_naive().and_hms_opt(23, 59, 59)?.and_utc();

			(end, cursor + TimeDelta::days(1))
		},
		Interval::Monthly => {
			let next_month = start_of_next_month(cursor)?;

			(next_month - TimeDelta::seconds(1), next_month)
		},
		Interval::Yearly => {
			let next_year = Utc.with_ymd_and_hms(cursor.year() + 1, 1, 1, 0, 0, 0).single()?;

			(next_year - TimeDelta::seconds(1), next_year)
		},
	};

	Some(Window { start: cursor, end: end.min(now), next_cursor })
}

/// Render a UTC instant in the wire format.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
	ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a wire-format timestamp into a UTC instant.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
	Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn start_of_next_month(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
	let (year, month) = if ts.month() == 12 { (ts.year() + 1, 1) } else { (ts.year(), ts.month() + 1) };

	Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn ts(raw: &str) -> DateTime<Utc> {
		parse_timestamp(raw).expect("timestamp")
	}

	#[test]
	fn interval_selector_accepts_full_as_yearly() {
		assert_eq!(Interval::parse("daily"), Some(Interval::Daily));
		assert_eq!(Interval::parse("Monthly"), Some(Interval::Monthly));
		assert_eq!(Interval::parse("full"), Some(Interval::Yearly));
		assert_eq!(Interval::parse("hourly"), None);
	}

	#[test]
	fn daily_window_ends_on_the_last_second_of_the_day() {
		let window = plan_window(ts("2020-06-16T00:00:00Z"), Interval::Daily, ts("2021-01-01T00:00:00Z"))
			.expect("window");

		assert_eq!(window.start, ts("2020-06-16T00:00:00Z"));
		assert_eq!(window.end, ts("2020-06-16T23:59:59Z"));
		assert_eq!(window.next_cursor, ts("2020-06-17T00:00:00Z"));
	}

	#[test]
	fn monthly_window_from_a_mid_month_cursor_covers_the_remainder() {
		let window =
			plan_window(ts("2020-06-16T00:00:00Z"), Interval::Monthly, ts("2021-01-01T00:00:00Z"))
				.expect("window");

		assert_eq!(window.start, ts("2020-06-16T00:00:00Z"));
		assert_eq!(window.end, ts("2020-06-30T23:59:59Z"));
		assert_eq!(window.next_cursor, ts("2020-07-01T00:00:00Z"));
	}

	#[test]
	fn monthly_window_rolls_december_into_the_next_year() {
		let window =
			plan_window(ts("2020-12-05T00:00:00Z"), Interval::Monthly, ts("2021-06-01T00:00:00Z"))
				.expect("window");

		assert_eq!(window.end, ts("2020-12-31T23:59:59Z"));
		assert_eq!(window.next_cursor, ts("2021-01-01T00:00:00Z"));
	}

	#[test]
	fn yearly_window_ends_on_december_31() {
		let window =
			plan_window(ts("1900-01-02T00:00:00Z"), Interval::Yearly, ts("2021-01-01T00:00:00Z"))
				.expect("window");

		assert_eq!(window.end, ts("1900-12-31T23:59:59Z"));
		assert_eq!(window.next_cursor, ts("1901-01-01T00:00:00Z"));
	}

	#[test]
	fn window_end_is_clamped_at_now() {
		let now = ts("2020-06-16T12:30:00Z");
		let window = plan_window(ts("2020-01-01T00:00:00Z"), Interval::Yearly, now).expect("window");

		assert_eq!(window.end, now);
		// The next cursor still advances past the clamp, terminating the sweep.
		assert_eq!(window.next_cursor, ts("2021-01-01T00:00:00Z"));
	}

	#[test]
	fn planning_stops_once_the_cursor_passes_now() {
		assert!(
			plan_window(ts("2021-01-01T00:00:01Z"), Interval::Daily, ts("2021-01-01T00:00:00Z"))
				.is_none()
		);
	}

	#[test]
	fn timestamps_render_in_the_wire_format() {
		let instant = ts("2020-06-30T23:59:59Z");

		assert_eq!(format_timestamp(instant), "2020-06-30T23:59:59Z");
		assert!(parse_timestamp("not a timestamp").is_err());
	}
}
