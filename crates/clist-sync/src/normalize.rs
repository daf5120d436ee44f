//! Date, time zone and duration normalization for raw contest records.
//!
//! Absolute forms (epoch seconds, timestamps carrying an offset) are tried on the whole
//! string. Anything else has its trailing zone token stripped first, then the local
//! strategies run in order and the result is placed in the token's zone, the record's
//! zone or the resource's zone, whichever is found first.

use std::sync::LazyLock;

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};
use chrono_tz::Tz;
use clist_core::{RawContestRecord, SkipReason};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unparseable {field} {value:?}")]
    InvalidTime { field: &'static str, value: String },
    #[error("unknown time zone {0:?}")]
    UnknownTimezone(String),
    #[error("unparseable duration {0:?}")]
    InvalidDuration(String),
    #[error("need two of start_time, end_time and duration")]
    InsufficientTimes,
}

impl From<NormalizeError> for SkipReason {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::InsufficientTimes => SkipReason::InsufficientTimes,
            other => SkipReason::InvalidTime(other.to_string()),
        }
    }
}

/// A zone a local wall-clock time can be placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Zone {
    pub fn utc() -> Self {
        Zone::Fixed(Utc.fix())
    }

    pub fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Zone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc)),
            Zone::Named(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                // wall-clock time inside a DST gap
                .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Zone abbreviations. Most are fixed offsets; a few follow an IANA zone.
const ABBREVIATIONS: &[(&str, AbbrevZone)] = &[
    ("UTC", AbbrevZone::Minutes(0)),
    ("GMT", AbbrevZone::Minutes(0)),
    ("UT", AbbrevZone::Minutes(0)),
    ("Z", AbbrevZone::Minutes(0)),
    ("WET", AbbrevZone::Minutes(0)),
    ("WEST", AbbrevZone::Minutes(60)),
    ("BST", AbbrevZone::Minutes(60)),
    ("CET", AbbrevZone::Minutes(60)),
    ("CEST", AbbrevZone::Minutes(120)),
    ("EET", AbbrevZone::Minutes(120)),
    ("EEST", AbbrevZone::Minutes(180)),
    ("MSK", AbbrevZone::Iana(chrono_tz::Europe::Moscow)),
    ("IST", AbbrevZone::Minutes(330)),
    ("CST", AbbrevZone::Minutes(-360)),
    ("CDT", AbbrevZone::Minutes(-300)),
    ("EST", AbbrevZone::Minutes(-300)),
    ("EDT", AbbrevZone::Minutes(-240)),
    ("MST", AbbrevZone::Minutes(-420)),
    ("MDT", AbbrevZone::Minutes(-360)),
    ("PST", AbbrevZone::Minutes(-480)),
    ("PDT", AbbrevZone::Minutes(-420)),
    ("AKST", AbbrevZone::Minutes(-540)),
    ("HST", AbbrevZone::Minutes(-600)),
    ("SGT", AbbrevZone::Minutes(480)),
    ("HKT", AbbrevZone::Minutes(480)),
    ("JST", AbbrevZone::Minutes(540)),
    ("KST", AbbrevZone::Minutes(540)),
    ("AEST", AbbrevZone::Minutes(600)),
    ("AEDT", AbbrevZone::Minutes(660)),
    ("NZST", AbbrevZone::Minutes(720)),
    ("NZDT", AbbrevZone::Minutes(780)),
];

#[derive(Debug, Clone, Copy)]
enum AbbrevZone {
    Minutes(i32),
    Iana(Tz),
}

static OFFSET_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i:(?:utc|gmt))?([+-])(\d{1,2})(?::?(\d{2}))?$").unwrap()
});

fn fixed_minutes(minutes: i32) -> Option<Zone> {
    FixedOffset::east_opt(minutes * 60).map(Zone::Fixed)
}

/// `+03:00`, `+0300`, `UTC+3`, `GMT-5:30`, an abbreviation or an IANA name.
pub fn parse_zone(token: &str) -> Option<Zone> {
    let token = token.trim().trim_start_matches('(').trim_end_matches(')');
    if token.is_empty() {
        return None;
    }
    if let Some(caps) = OFFSET_TOKEN.captures(token) {
        let hours: i32 = caps[2].parse().ok()?;
        let minutes: i32 = caps.get(3).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        if hours > 14 || minutes > 59 {
            return None;
        }
        let total = hours * 60 + minutes;
        return fixed_minutes(if &caps[1] == "-" { -total } else { total });
    }
    let upper = token.to_ascii_uppercase();
    if let Some((_, zone)) = ABBREVIATIONS.iter().find(|(name, _)| *name == upper) {
        return match zone {
            AbbrevZone::Minutes(m) => fixed_minutes(*m),
            AbbrevZone::Iana(tz) => Some(Zone::Named(*tz)),
        };
    }
    token.parse::<Tz>().ok().map(Zone::Named)
}

/// Splits a trailing zone token off a date string.
pub fn split_zone(raw: &str) -> (&str, Option<Zone>) {
    let trimmed = raw.trim();
    if let Some((head, tail)) = trimmed.rsplit_once(char::is_whitespace) {
        if let Some(zone) = parse_zone(tail) {
            return (head.trim_end(), Some(zone));
        }
    }
    // `10:00Z` or `10:00+03:00` glued to the time
    if let Some(head) = trimmed.strip_suffix(['Z', 'z']) {
        if head.ends_with(|c: char| c.is_ascii_digit()) {
            return (head, Some(Zone::utc()));
        }
    }
    if let Some(idx) = trimmed.rfind(['+', '-']) {
        let (head, tail) = trimmed.split_at(idx);
        if head.contains(':') && head.ends_with(|c: char| c.is_ascii_digit()) {
            if let Some(zone) = parse_zone(tail) {
                return (head, Some(zone));
            }
        }
    }
    (trimmed, None)
}

pub type LocalStrategy = fn(&str) -> Option<NaiveDateTime>;

/// Local wall-clock strategies, tried in this order after the zone token is removed.
pub const LOCAL_STRATEGIES: &[(&str, LocalStrategy)] = &[
    ("iso_local", parse_iso_local),
    ("dotted", parse_dotted),
    ("slashed", parse_slashed),
    ("textual_month", parse_textual),
    ("date_only", parse_date_only),
];

/// Epoch seconds (or milliseconds) as integer or float.
pub fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    let int_part = s.split('.').next()?;
    if int_part.len() < 9 || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: f64 = s.parse().ok()?;
    let seconds = if int_part.len() >= 12 { value / 1000.0 } else { value };
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9).round() as u32;
    DateTime::from_timestamp(whole, nanos.min(999_999_999))
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M:%S %z",
    "%Y-%m-%d %H:%M %z",
    "%a, %d %b %Y %H:%M:%S %z",
];

/// RFC 3339 and ISO 8601 timestamps that carry their own offset.
pub fn parse_with_offset(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_rfc2822(s) {
        return Some(t.with_timezone(&Utc));
    }
    OFFSET_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn first_naive(s: &str, formats: &[&str]) -> Option<NaiveDateTime> {
    formats
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn first_date(s: &str, formats: &[&str]) -> Option<NaiveDateTime> {
    formats
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_iso_local(s: &str) -> Option<NaiveDateTime> {
    first_naive(
        s,
        &[
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%d %H:%M",
            "%Y-%m-%dT%H:%M",
        ],
    )
}

pub fn parse_dotted(s: &str) -> Option<NaiveDateTime> {
    first_naive(s, &["%d.%m.%Y %H:%M:%S", "%d.%m.%Y %H:%M"]).or_else(|| first_date(s, &["%d.%m.%Y"]))
}

pub fn parse_slashed(s: &str) -> Option<NaiveDateTime> {
    first_naive(s, &["%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M"]).or_else(|| first_date(s, &["%m/%d/%Y"]))
}

pub fn parse_date_only(s: &str) -> Option<NaiveDateTime> {
    first_date(s, &["%Y-%m-%d"])
}

const ENGLISH_MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

const RUSSIAN_MONTHS: [[&str; 2]; 12] = [
    ["январь", "января"],
    ["февраль", "февраля"],
    ["март", "марта"],
    ["апрель", "апреля"],
    ["май", "мая"],
    ["июнь", "июня"],
    ["июль", "июля"],
    ["август", "августа"],
    ["сентябрь", "сентября"],
    ["октябрь", "октября"],
    ["ноябрь", "ноября"],
    ["декабрь", "декабря"],
];

/// Full names, genitive forms and prefixes of at least three letters.
fn month_from_token(token: &str) -> Option<u32> {
    if token.chars().count() < 3 {
        return None;
    }
    let position = ENGLISH_MONTHS
        .iter()
        .position(|name| name.starts_with(token))
        .or_else(|| {
            RUSSIAN_MONTHS
                .iter()
                .position(|forms| forms.iter().any(|f| f.starts_with(token)))
        })?;
    Some(position as u32 + 1)
}

fn clock(token: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(token, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(token, "%H:%M"))
        .ok()
}

/// `May 1, 2024 10:00`, `1 мая 2024 г. 10:00`, `Wed, 01 May 2024`, `June 3rd 2024 7:30 pm`.
pub fn parse_textual(s: &str) -> Option<NaiveDateTime> {
    let lowered = s.to_lowercase().replace(',', " ");
    let mut month = None;
    let mut day = None;
    let mut year = None;
    let mut time = None;
    let mut meridiem = None;

    for token in lowered.split_whitespace() {
        let token = token.trim_end_matches('.');
        let (body, suffix) = match token.find(|c: char| c.is_ascii_alphabetic()) {
            Some(idx) if idx > 0 => token.split_at(idx),
            _ => (token, ""),
        };
        if matches!(token, "am" | "pm") {
            meridiem = Some(token.to_string());
        } else if body.contains(':') {
            time = Some(clock(body)?);
            if matches!(suffix, "am" | "pm") {
                meridiem = Some(suffix.to_string());
            }
        } else if body.bytes().all(|b| b.is_ascii_digit()) && !body.is_empty() {
            if !matches!(suffix, "" | "st" | "nd" | "rd" | "th") {
                return None;
            }
            match body.len() {
                4 if year.is_none() => year = body.parse::<i32>().ok(),
                1 | 2 if day.is_none() => day = body.parse::<u32>().ok(),
                _ => return None,
            }
        } else if let Some(m) = month.is_none().then(|| month_from_token(token)).flatten() {
            month = Some(m);
        } else if token.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }
        // weekday names and filler such as `г` or `at` are ignored
    }

    let date = NaiveDate::from_ymd_opt(year?, month?, day?)?;
    let mut time = time.unwrap_or(NaiveTime::MIN);
    if let Some(meridiem) = meridiem {
        use chrono::Timelike;
        let hour = time.hour() % 12 + if meridiem == "pm" { 12 } else { 0 };
        time = time.with_hour(hour)?;
    }
    Some(date.and_time(time))
}

/// Parses one timestamp. `fallback` is used when the string names no zone itself.
pub fn parse_time(raw: &str, fallback: Zone) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(t) = parse_epoch(raw).or_else(|| parse_with_offset(raw)) {
        return Some(t);
    }
    let (local, token_zone) = split_zone(raw);
    let zone = token_zone.unwrap_or(fallback);
    LOCAL_STRATEGIES
        .iter()
        .find_map(|(_, strategy)| strategy(local))
        .and_then(|naive| zone.localize(naive))
}

static UNIT_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*([a-zа-яё]+)").unwrap()
});

fn unit_seconds(unit: &str) -> Option<f64> {
    let unit = unit.to_lowercase();
    let secs = match unit.as_str() {
        "w" | "wk" | "week" | "weeks" | "нед" | "неделя" | "недели" | "недель" => 604_800.0,
        "d" | "day" | "days" | "д" | "дн" | "день" | "дня" | "дней" => 86_400.0,
        "h" | "hr" | "hrs" | "hour" | "hours" | "ч" | "час" | "часа" | "часов" => 3_600.0,
        "m" | "min" | "mins" | "minute" | "minutes" | "мин" | "минут" | "минуты" | "минута" => 60.0,
        "s" | "sec" | "secs" | "second" | "seconds" | "с" | "сек" | "секунд" => 1.0,
        _ => return None,
    };
    Some(secs)
}

fn colon_duration(s: &str) -> Option<i64> {
    let mut fields: Vec<&str> = s.split(':').map(str::trim).collect();
    fields.truncate(4);
    let mut days = 0i64;
    let first = fields[0];
    if let Some((d, h)) = first.split_once('.') {
        days = d.parse().ok()?;
        fields[0] = h;
    }
    let nums: Vec<i64> = fields
        .iter()
        .map(|f| f.parse::<i64>().ok())
        .collect::<Option<_>>()?;
    let (d, h, m, s) = match nums.as_slice() {
        [h, m] => (0, *h, *m, 0),
        [h, m, s] => (0, *h, *m, *s),
        [d, h, m, s] => (*d, *h, *m, *s),
        _ => return None,
    };
    days.checked_add(d)?
        .checked_mul(86_400)?
        .checked_add(h.checked_mul(3_600)?)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)
}

/// Longest duration accepted from a source.
pub const MAX_DURATION_SECS: i64 = 10 * 366 * 86_400;

fn bounded_secs(secs: f64) -> Option<i64> {
    (secs.is_finite() && secs.abs() <= MAX_DURATION_SECS as f64).then(|| secs.round() as i64)
}

/// Duration in seconds. Empty or zero durations are `None`.
pub fn parse_duration(raw: &str) -> Result<Option<i64>, NormalizeError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let invalid = || NormalizeError::InvalidDuration(raw.to_string());

    let secs = if s.contains(':') {
        colon_duration(s).ok_or_else(invalid)?
    } else if let Ok(minutes) = s.replace(',', ".").parse::<f64>() {
        bounded_secs(minutes * 60.0).ok_or_else(invalid)?
    } else {
        let mut total = 0.0;
        let mut matched = false;
        for caps in UNIT_PART.captures_iter(s) {
            let value: f64 = caps[1].replace(',', ".").parse().map_err(|_| invalid())?;
            total += value * unit_seconds(&caps[2]).ok_or_else(invalid)?;
            matched = true;
        }
        if !matched {
            return Err(invalid());
        }
        bounded_secs(total).ok_or_else(invalid)?
    };
    if secs.abs() > MAX_DURATION_SECS {
        return Err(invalid());
    }
    Ok((secs != 0).then_some(secs))
}

/// Signed duration such as `-1:00` or `+30 min`.
pub fn parse_shift(raw: &str) -> Result<Duration, NormalizeError> {
    let s = raw.trim();
    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let secs = parse_duration(body)?.unwrap_or(0);
    Duration::try_seconds(sign * secs).ok_or_else(|| NormalizeError::InvalidDuration(raw.to_string()))
}

/// Start, end and the explicitly stated duration of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContestTimes {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: Option<i64>,
}

/// Record zone first, then the resource's. An unknown zone name is an error, not a silent UTC.
pub fn record_zone(record: &RawContestRecord, resource_timezone: &str) -> Result<Zone, NormalizeError> {
    let name = record
        .timezone
        .as_deref()
        .filter(|tz| !tz.trim().is_empty())
        .unwrap_or(resource_timezone);
    parse_zone(name).ok_or_else(|| NormalizeError::UnknownTimezone(name.to_string()))
}

fn shifted(
    field: &'static str,
    time: Option<DateTime<Utc>>,
    shift: Option<&str>,
) -> Result<Option<DateTime<Utc>>, NormalizeError> {
    let (Some(time), Some(shift)) = (time, shift) else {
        return Ok(time);
    };
    time.checked_add_signed(parse_shift(shift)?)
        .map(Some)
        .ok_or_else(|| NormalizeError::InvalidTime {
            field,
            value: shift.to_string(),
        })
}

/// Parses times, applies shifts, then derives the missing end or start from the duration.
pub fn normalize_times(
    record: &RawContestRecord,
    resource_timezone: &str,
) -> Result<ContestTimes, NormalizeError> {
    let zone = record_zone(record, resource_timezone)?;
    let parse = |field: &'static str, value: &Option<String>| -> Result<Option<DateTime<Utc>>, NormalizeError> {
        match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(v) => parse_time(v, zone).map(Some).ok_or_else(|| NormalizeError::InvalidTime {
                field,
                value: v.to_string(),
            }),
        }
    };

    let mut start = parse("start_time", &record.start_time)?;
    let mut end = parse("end_time", &record.end_time)?;
    let duration = match record.duration.as_deref() {
        Some(d) => parse_duration(d)?,
        None => None,
    };

    let start = shifted("start_time", start, record.start_time_shift.as_deref())?;
    let end = shifted("end_time", end, record.end_time_shift.as_deref())?;

    let out_of_range = |field: &'static str| NormalizeError::InvalidTime {
        field,
        value: record.duration.clone().unwrap_or_default(),
    };
    let (start, end) = match (start, end, duration.and_then(Duration::try_seconds)) {
        (Some(s), Some(e), _) => (s, e),
        (Some(s), None, Some(d)) => (s, s.checked_add_signed(d).ok_or_else(|| out_of_range("end_time"))?),
        (None, Some(e), Some(d)) => (e.checked_sub_signed(d).ok_or_else(|| out_of_range("start_time"))?, e),
        _ => return Err(NormalizeError::InsufficientTimes),
    };
    Ok(ContestTimes {
        start,
        end,
        duration_secs: duration,
    })
}
