use async_trait::async_trait;
use clist_core::{JsonObject, RawContestRecord};
use clist_storage::{Fetch, FetchOptions};
use serde_json::json;
use tracing::warn;

use crate::{text_or_none, AdapterError, ModuleContext, SourceModule};

/// Any iCalendar feed published at the resource's parse url. One `VEVENT` per contest.
#[derive(Debug, Clone, Copy, Default)]
pub struct ICalFeed;

#[derive(Debug)]
struct Property<'a> {
    name: String,
    params: Vec<(String, &'a str)>,
    value: &'a str,
}

impl Property<'_> {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.trim_matches('"'))
    }
}

/// Joins continuation lines (leading space or tab) onto the previous line.
fn unfold(body: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in body.lines() {
        let raw = raw.trim_end_matches('\r');
        match (raw.strip_prefix([' ', '\t']), lines.last_mut()) {
            (Some(rest), Some(last)) => last.push_str(rest),
            _ => lines.push(raw.to_string()),
        }
    }
    lines
}

fn split_property(line: &str) -> Option<Property<'_>> {
    let colon = line.find(':')?;
    let (head, value) = (&line[..colon], &line[colon + 1..]);
    let mut parts = head.split(';');
    let name = parts.next()?.trim().to_ascii_uppercase();
    let params = parts
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
        .collect();
    Some(Property { name, params, value })
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// `20240501T100000Z` → `2024-05-01T10:00:00Z`, floating times lose the `T`, dates stay dates.
fn ical_datetime(value: &str) -> Option<String> {
    let value = value.trim();
    let (date, time) = match value.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (value, None),
    };
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let date = format!("{}-{}-{}", &date[..4], &date[4..6], &date[6..]);
    let Some(time) = time else {
        return Some(date);
    };
    let (clock, utc) = match time.strip_suffix('Z') {
        Some(clock) => (clock, true),
        None => (time, false),
    };
    if clock.len() < 4 || !clock.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds = clock.get(4..6).unwrap_or("00");
    let clock = format!("{}:{}:{}", &clock[..2], &clock[2..4], seconds);
    Some(if utc {
        format!("{date}T{clock}Z")
    } else {
        format!("{date} {clock}")
    })
}

/// RFC 5545 duration (`P1DT2H30M`, `PT90M`, `P1W`) as `D:HH:MM:SS`.
fn ical_duration(value: &str) -> Option<String> {
    let body = value.trim().trim_start_matches('+').strip_prefix('P')?;
    let mut total: i64 = 0;
    let mut number = String::new();
    let mut in_time = false;
    for c in body.chars() {
        match c {
            'T' => in_time = true,
            d if d.is_ascii_digit() => number.push(d),
            unit => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                total += n * match (unit, in_time) {
                    ('W', false) => 7 * 86_400,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return None,
                };
            }
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(format!(
        "{}:{:02}:{:02}:{:02}",
        total / 86_400,
        total % 86_400 / 3_600,
        total % 3_600 / 60,
        total % 60
    ))
}

impl ICalFeed {
    pub fn parse_calendar(body: &str) -> Vec<RawContestRecord> {
        let mut out = Vec::new();
        let mut current: Option<RawContestRecord> = None;
        for line in unfold(body) {
            let Some(prop) = split_property(&line) else {
                continue;
            };
            match (prop.name.as_str(), current.as_mut()) {
                ("BEGIN", None) if prop.value.eq_ignore_ascii_case("VEVENT") => {
                    current = Some(RawContestRecord::default());
                }
                ("END", Some(_)) if prop.value.eq_ignore_ascii_case("VEVENT") => {
                    if let Some(record) = current.take() {
                        if record.title.is_empty() {
                            warn!("ical event without summary");
                        } else {
                            out.push(record);
                        }
                    }
                }
                ("SUMMARY", Some(record)) => record.title = unescape(prop.value).trim().to_string(),
                ("UID", Some(record)) => record.key = text_or_none(prop.value),
                ("URL", Some(record)) => record.url = text_or_none(prop.value),
                ("DTSTART", Some(record)) => {
                    record.start_time = ical_datetime(prop.value);
                    if let Some(tz) = prop.param("TZID") {
                        record.timezone = text_or_none(tz);
                    }
                }
                ("DTEND", Some(record)) => {
                    record.end_time = ical_datetime(prop.value);
                    if record.timezone.is_none() {
                        record.timezone = prop.param("TZID").and_then(text_or_none);
                    }
                }
                ("DURATION", Some(record)) => record.duration = ical_duration(prop.value),
                ("DESCRIPTION" | "LOCATION", Some(record)) => {
                    let text = unescape(prop.value);
                    if let Some(text) = text_or_none(&text) {
                        record
                            .info
                            .get_or_insert_with(JsonObject::new)
                            .insert(prop.name.to_ascii_lowercase(), json!(text));
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[async_trait]
impl SourceModule for ICalFeed {
    fn path(&self) -> &'static str {
        "ical"
    }

    async fn extract(
        &self,
        fetch: &dyn Fetch,
        ctx: &ModuleContext,
    ) -> Result<Vec<RawContestRecord>, AdapterError> {
        let feed = fetch
            .fetch(&ctx.parse_url, None, &FetchOptions::cached())
            .await?;
        Ok(Self::parse_calendar(&feed.body))
    }
}
