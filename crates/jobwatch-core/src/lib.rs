//! Core domain model, record fingerprinting and schedule arithmetic for jobwatch.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "jobwatch-core";

/// One search hit handed over by a search provider. Any field may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CandidateRecord {
    pub fn new(title: Option<&str>, url: Option<&str>, description: Option<&str>) -> Self {
        Self {
            title: title.map(str::to_string),
            url: url.map(str::to_string),
            description: description.map(str::to_string),
        }
    }
}

/// SHA-256 digest over the normalized identifying fields of a [`CandidateRecord`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(input: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(input.trim(), &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value).ok_or_else(|| format!("invalid fingerprint hex: {value:?}"))
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.to_hex()
    }
}

// Keeps ("ab", "") and ("a", "b") apart.
const FIELD_SEPARATOR: u8 = 0x1f;

pub fn normalize_field(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_lowercase()
}

/// Fingerprint over title, url and description, each trimmed and lower-cased.
///
/// Absent fields hash like empty strings. No salt is mixed in, so digests are stable
/// across processes and can be persisted.
pub fn fingerprint(record: &CandidateRecord) -> Fingerprint {
    let fields = [
        record.title.as_deref(),
        record.url.as_deref(),
        record.description.as_deref(),
    ];
    let mut hasher = Sha256::new();
    for (idx, field) in fields.into_iter().enumerate() {
        if idx > 0 {
            hasher.update([FIELD_SEPARATOR]);
        }
        hasher.update(normalize_field(field).as_bytes());
    }
    Fingerprint(hasher.finalize().into())
}

/// Report payload for a record that was not seen before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJobEvent {
    /// 1-based position of this report within its cycle.
    pub sequence: usize,
    pub job_title: String,
    pub query: String,
    pub record: CandidateRecord,
    pub fingerprint: Fingerprint,
    pub found_at: DateTime<Utc>,
}

/// Serde helpers for `HH:MM:SS` time-of-day values. Parsing also accepts `HH:MM` and a
/// full `YYYY-MM-DD HH:MM:SS` datetime, whose date part is ignored.
pub mod time_of_day {
    use chrono::{NaiveDateTime, NaiveTime};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M:%S";

    pub fn parse(input: &str) -> Option<NaiveTime> {
        let input = input.trim();
        NaiveTime::parse_from_str(input, FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M"))
            .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S").map(|dt| dt.time()))
            .ok()
    }

    pub fn format(time: &NaiveTime) -> String {
        time.format(FORMAT).to_string()
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid time of day {raw:?}, expected HH:MM[:SS]")))
    }
}

/// Daily time-of-day range during which cycles may run. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingWindow {
    #[serde(with = "time_of_day")]
    pub start: NaiveTime,
    #[serde(with = "time_of_day")]
    pub end: NaiveTime,
}

impl OperatingWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn crosses_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn is_open(&self, now: NaiveTime) -> bool {
        is_open(now, self.start, self.end)
    }
}

/// Inclusive time-of-day check. When `start > end` the window wraps past midnight
/// and is open from `start` through midnight up to `end`.
pub fn is_open(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

/// Resolves a wall-clock date/time in `tz`. Ambiguous times take the earlier instant;
/// times inside a DST gap move forward by the gap.
pub fn localize(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(naive + ChronoDuration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
    }
}

fn chrono_interval(interval: Duration) -> ChronoDuration {
    ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::MAX)
}

/// Start of the result range a cycle beginning at `now` should consider.
///
/// The first run anchors on the most recent occurrence of `start` in `tz`. Later runs
/// look back exactly one `interval`, whatever `last_run` was; a missed tick is a gap.
pub fn compute_look_back(
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    start: NaiveTime,
    tz: Tz,
    interval: Duration,
) -> DateTime<Utc> {
    let interval = chrono_interval(interval);
    let candidate = match last_run {
        None => {
            let local_now = now.with_timezone(&tz);
            let today = local_now.date_naive();
            let today_start = localize(tz, today, start);
            if local_now >= today_start {
                today_start.with_timezone(&Utc)
            } else {
                match today.pred_opt() {
                    Some(yesterday) => localize(tz, yesterday, start).with_timezone(&Utc),
                    None => today_start.with_timezone(&Utc) - ChronoDuration::days(1),
                }
            }
        }
        Some(_) => now.checked_sub_signed(interval).unwrap_or(DateTime::<Utc>::MIN_UTC),
    };
    clamp_look_back(candidate, now, interval)
}

fn clamp_look_back(candidate: DateTime<Utc>, now: DateTime<Utc>, interval: ChronoDuration) -> DateTime<Utc> {
    if candidate > now {
        now.checked_sub_signed(interval).unwrap_or(DateTime::<Utc>::MIN_UTC)
    } else {
        candidate
    }
}

/// Mutable scheduling state carried between cycles. Lives in memory only; a restart
/// behaves like a first run.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub last_run: Option<DateTime<Utc>>,
    pub window: OperatingWindow,
    pub time_zone: Tz,
    pub run_interval: Duration,
}

impl ScheduleState {
    pub fn new(window: OperatingWindow, time_zone: Tz, run_interval: Duration) -> Self {
        Self {
            last_run: None,
            window,
            time_zone,
            run_interval,
        }
    }

    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.time_zone).time()
    }

    pub fn is_window_open(&self, now: DateTime<Utc>) -> bool {
        self.window.is_open(self.local_time(now))
    }

    /// True when no cycle has run yet or a full interval has passed since the last one.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.signed_duration_since(last) >= chrono_interval(self.run_interval),
        }
    }

    pub fn look_back(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        compute_look_back(now, self.last_run, self.window.start, self.time_zone, self.run_interval)
    }

    pub fn record_run(&mut self, started_at: DateTime<Utc>) {
        self.last_run = Some(started_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveTime {
        time_of_day::parse(s).unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn rec(title: &str, url: &str) -> CandidateRecord {
        CandidateRecord::new(Some(title), Some(url), None)
    }

    #[test]
    fn fingerprint_ignores_case_and_surrounding_whitespace() {
        assert_eq!(fingerprint(&rec("A ", "U")), fingerprint(&rec("a", "u")));
        assert_eq!(
            fingerprint(&rec("  Senior Rust Engineer", "HTTPS://jobs.lever.co/x ")),
            fingerprint(&rec("senior rust engineer", "https://jobs.lever.co/x"))
        );
    }

    #[test]
    fn fingerprint_treats_missing_fields_as_empty() {
        let absent = CandidateRecord::new(Some("Dev"), None, None);
        let empty = CandidateRecord::new(Some("dev"), Some("   "), Some(""));
        assert_eq!(fingerprint(&absent), fingerprint(&empty));
        assert_eq!(fingerprint(&CandidateRecord::default()), fingerprint(&CandidateRecord::default()));
    }

    #[test]
    fn fingerprint_keeps_field_boundaries() {
        assert_ne!(fingerprint(&rec("ab", "")), fingerprint(&rec("a", "b")));
        let with_desc = CandidateRecord::new(Some("a"), Some("u"), Some("d"));
        assert_ne!(fingerprint(&with_desc), fingerprint(&rec("a", "u")));
    }

    #[test]
    fn fingerprint_is_stable_across_processes() {
        // Pinned digest; a change here invalidates every persisted cache.
        let fp = fingerprint(&CandidateRecord::default());
        let expected = {
            let mut h = Sha256::new();
            h.update([FIELD_SEPARATOR, FIELD_SEPARATOR]);
            hex::encode(h.finalize())
        };
        assert_eq!(fp.to_hex(), expected);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn gate_matches_inclusive_daytime_window() {
        let (start, end) = (t("09:00"), t("17:00"));
        assert!(!is_open(t("08:59"), start, end));
        assert!(is_open(t("09:00"), start, end));
        assert!(is_open(t("12:30"), start, end));
        assert!(is_open(t("17:00"), start, end));
        assert!(!is_open(t("17:01"), start, end));
    }

    #[test]
    fn gate_wraps_windows_that_cross_midnight() {
        let window = OperatingWindow::new(t("22:00"), t("06:00"));
        assert!(window.crosses_midnight());
        assert!(window.is_open(t("22:00")));
        assert!(window.is_open(t("23:59:59")));
        assert!(window.is_open(t("00:00")));
        assert!(window.is_open(t("06:00")));
        assert!(!window.is_open(t("06:01")));
        assert!(!window.is_open(t("21:59")));
        assert!(!window.is_open(t("12:00")));
    }

    #[test]
    fn first_run_before_start_looks_back_to_yesterday() {
        let look_back = compute_look_back(
            utc("2026-03-10T08:00:00Z"),
            None,
            t("09:00"),
            Tz::UTC,
            Duration::from_secs(3600),
        );
        assert_eq!(look_back, utc("2026-03-09T09:00:00Z"));
    }

    #[test]
    fn first_run_after_start_looks_back_to_today() {
        let look_back = compute_look_back(
            utc("2026-03-10T10:00:00Z"),
            None,
            t("09:00"),
            Tz::UTC,
            Duration::from_secs(3600),
        );
        assert_eq!(look_back, utc("2026-03-10T09:00:00Z"));

        let at_start = compute_look_back(
            utc("2026-03-10T09:00:00Z"),
            None,
            t("09:00"),
            Tz::UTC,
            Duration::from_secs(3600),
        );
        assert_eq!(at_start, utc("2026-03-10T09:00:00Z"));
    }

    #[test]
    fn first_run_uses_configured_timezone_for_today() {
        // 13:30 UTC is 08:30 in New York (EST, UTC-5) on this date: before the local start.
        let tz: Tz = "America/New_York".parse().unwrap();
        let look_back = compute_look_back(
            utc("2026-01-15T13:30:00Z"),
            None,
            t("09:00"),
            tz,
            Duration::from_secs(3600),
        );
        assert_eq!(look_back, utc("2026-01-14T14:00:00Z"));
    }

    #[test]
    fn later_runs_look_back_one_interval() {
        let last = utc("2026-03-10T09:00:00Z");
        let now = last + ChronoDuration::minutes(90);
        let look_back = compute_look_back(now, Some(last), t("09:00"), Tz::UTC, Duration::from_secs(3600));
        assert_eq!(look_back, now - ChronoDuration::minutes(60));

        let far_last = utc("2026-01-01T00:00:00Z");
        let again = compute_look_back(now, Some(far_last), t("09:00"), Tz::UTC, Duration::from_secs(3600));
        assert_eq!(again, look_back);
    }

    #[test]
    fn look_back_after_now_is_clamped() {
        let now = utc("2026-03-10T09:00:00Z");
        let clamped = clamp_look_back(now + ChronoDuration::hours(2), now, ChronoDuration::hours(1));
        assert_eq!(clamped, now - ChronoDuration::hours(1));
        assert_eq!(clamp_look_back(now, now, ChronoDuration::hours(1)), now);
    }

    #[test]
    fn schedule_state_is_due_after_one_interval() {
        let mut state = ScheduleState::new(
            OperatingWindow::new(t("09:00"), t("17:00")),
            Tz::UTC,
            Duration::from_secs(3600),
        );
        let start = utc("2026-03-10T09:05:00Z");
        assert!(state.is_due(start));
        state.record_run(start);
        assert!(!state.is_due(start + ChronoDuration::minutes(59)));
        assert!(state.is_due(start + ChronoDuration::minutes(60)));
        assert!(state.is_window_open(start));
        assert!(!state.is_window_open(utc("2026-03-10T17:30:00Z")));
    }

    #[test]
    fn time_of_day_accepts_short_form_and_formats_long_form() {
        let parsed = time_of_day::parse("09:30").unwrap();
        assert_eq!(time_of_day::format(&parsed), "09:30:00");
        assert_eq!(time_of_day::parse(&time_of_day::format(&parsed)), Some(parsed));
        assert_eq!(time_of_day::parse("25:00"), None);
        assert_eq!(time_of_day::parse("2024-12-10 17:45:00"), time_of_day::parse("17:45"));
    }
}
