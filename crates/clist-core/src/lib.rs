//! Core domain model for the contest updater: resources, raw records, normalized and persisted contests.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "clist-core";

/// Placeholder substituted in `Resource::parse_url`.
pub const YEAR_PLACEHOLDER: &str = "${YEAR}";

pub type JsonObject = Map<String, JsonValue>;

/// How contests are pulled out of a resource: a registered module or a single named-capture regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extraction {
    Module(String),
    Regex(String),
}

/// A configured contest source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub host: String,
    pub url: String,
    #[serde(default)]
    pub parse_url: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    pub extraction: Extraction,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_remove_started: bool,
    #[serde(default)]
    pub info: JsonValue,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

impl Resource {
    /// The page to parse, with `${YEAR}` replaced. Falls back to the base url.
    pub fn parse_url_for_year(&self, year: i32) -> String {
        self.parse_url
            .as_deref()
            .unwrap_or(&self.url)
            .replace(YEAR_PLACEHOLDER, &year.to_string())
    }

    pub fn quirks(&self) -> Result<Quirks, serde_json::Error> {
        match self.info.get("quirks") {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone()),
            _ => Ok(Quirks::default()),
        }
    }
}

/// Per-resource behaviour switches stored under `info.quirks`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quirks {
    /// Every contest is historical; never apply the staleness bound.
    #[serde(default)]
    pub archive_only: bool,
    /// Regex removed from titles before key synthesis and slugging.
    #[serde(default)]
    pub strip_title: Option<String>,
    /// Synthesize missing keys from the contest url instead of year + title.
    #[serde(default)]
    pub key_from_url: bool,
}

/// One contest occurrence as extracted by a source module, before any normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawContestRecord {
    pub title: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub standings_url: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub old_key: Option<String>,
    #[serde(default)]
    pub delete_key: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub rid: Option<i64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub info: Option<JsonObject>,
    #[serde(default)]
    pub start_time_shift: Option<String>,
    #[serde(default)]
    pub end_time_shift: Option<String>,
    #[serde(default)]
    pub skip_check_time: bool,
    #[serde(default)]
    pub skip_update_key: bool,
    #[serde(default)]
    pub ignore_times_after_start: bool,
    #[serde(default)]
    pub delete_after_end: bool,
    #[serde(default)]
    pub inherit_stage: bool,
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub unchanged: Vec<String>,
}

impl RawContestRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Sets a raw string field by its record name. Returns false for names that are not string fields.
    pub fn set_text_field(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "title" => {
                self.title = value;
                return true;
            }
            "start_time" => &mut self.start_time,
            "end_time" => &mut self.end_time,
            "duration" => &mut self.duration,
            "url" => &mut self.url,
            "standings_url" => &mut self.standings_url,
            "key" => &mut self.key,
            "old_key" => &mut self.old_key,
            "delete_key" => &mut self.delete_key,
            "host" => &mut self.host,
            "timezone" => &mut self.timezone,
            "start_time_shift" => &mut self.start_time_shift,
            "end_time_shift" => &mut self.end_time_shift,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Persisted columns an upsert may be told to leave alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestField {
    Title,
    Url,
    StandingsUrl,
    StartTime,
    EndTime,
    DurationInSecs,
    Slug,
    TitlePath,
    Info,
}

impl ContestField {
    pub const ALL: [ContestField; 9] = [
        ContestField::Title,
        ContestField::Url,
        ContestField::StandingsUrl,
        ContestField::StartTime,
        ContestField::EndTime,
        ContestField::DurationInSecs,
        ContestField::Slug,
        ContestField::TitlePath,
        ContestField::Info,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            ContestField::Title => "title",
            ContestField::Url => "url",
            ContestField::StandingsUrl => "standings_url",
            ContestField::StartTime => "start_time",
            ContestField::EndTime => "end_time",
            ContestField::DurationInSecs => "duration_in_secs",
            ContestField::Slug => "slug",
            ContestField::TitlePath => "title_path",
            ContestField::Info => "info",
        }
    }

    pub fn is_time(&self) -> bool {
        matches!(
            self,
            ContestField::StartTime | ContestField::EndTime | ContestField::DurationInSecs
        )
    }
}

#[derive(Debug, Error)]
#[error("unknown contest field: {0}")]
pub struct UnknownField(pub String);

impl FromStr for ContestField {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let name = if name == "duration" { "duration_in_secs" } else { name };
        ContestField::ALL
            .into_iter()
            .find(|f| f.column() == name)
            .ok_or_else(|| UnknownField(s.to_string()))
    }
}

/// A raw record after time, key and title resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedContest {
    pub resource_id: i64,
    pub key: String,
    pub title: String,
    pub url: Option<String>,
    pub standings_url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Duration as stated by the source, if any; wins over `end - start` when persisted.
    pub duration_secs: Option<i64>,
    pub slug: String,
    pub title_path: String,
    pub info: JsonObject,
    pub old_key: Option<String>,
    pub delete_key: Option<String>,
    pub skip_check_time: bool,
    pub skip_update_key: bool,
    pub ignore_times_after_start: bool,
    pub delete_after_end: bool,
    pub inherit_stage: bool,
    pub duplicate: bool,
    pub unchanged: BTreeSet<ContestField>,
}

impl NormalizedContest {
    pub fn duration_in_secs(&self) -> i64 {
        self.duration_secs
            .unwrap_or_else(|| (self.end_time - self.start_time).num_seconds())
    }
}

/// A row of the `contests` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contest {
    pub id: i64,
    pub resource_id: i64,
    pub key: String,
    pub title: String,
    pub url: Option<String>,
    pub standings_url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_in_secs: i64,
    pub slug: String,
    pub title_path: String,
    pub info: JsonValue,
    pub is_auto_added: bool,
    pub auto_updated: Option<DateTime<Utc>>,
}

/// Why a record never reached the store this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    MissingTitle,
    InvalidTime(String),
    InsufficientTimes,
    UnknownResource(String),
    EndBeforeStart,
    TooFarInFuture,
    Stale,
    SkipUpdateKey,
    TitleFilter,
    Locked,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingTitle => "missing_title",
            SkipReason::InvalidTime(_) => "invalid_time",
            SkipReason::InsufficientTimes => "insufficient_times",
            SkipReason::UnknownResource(_) => "unknown_resource",
            SkipReason::EndBeforeStart => "end_before_start",
            SkipReason::TooFarInFuture => "too_far_in_future",
            SkipReason::Stale => "stale",
            SkipReason::SkipUpdateKey => "skip_update_key",
            SkipReason::TitleFilter => "title_filter",
            SkipReason::Locked => "locked",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidTime(detail) | SkipReason::UnknownResource(detail) => {
                write!(f, "{}: {}", self.as_str(), detail)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(info: JsonValue) -> Resource {
        Resource {
            id: 1,
            host: "example.com".into(),
            url: "https://example.com/".into(),
            parse_url: Some("https://example.com/contests/${YEAR}".into()),
            api_url: None,
            extraction: Extraction::Module("codeforces".into()),
            timezone: "UTC".into(),
            enabled: true,
            auto_remove_started: false,
            info,
        }
    }

    #[test]
    fn parse_url_substitutes_year() {
        let r = resource(JsonValue::Null);
        assert_eq!(r.parse_url_for_year(2024), "https://example.com/contests/2024");
    }

    #[test]
    fn quirks_default_when_absent() {
        assert_eq!(resource(json!({})).quirks().unwrap(), Quirks::default());
        let q = resource(json!({"quirks": {"archive_only": true, "strip_title": "\\s*\\(Div\\. \\d\\)"}}))
            .quirks()
            .unwrap();
        assert!(q.archive_only);
        assert!(!q.key_from_url);
        assert!(q.strip_title.is_some());
    }

    #[test]
    fn contest_field_parses_column_names() {
        assert_eq!("title".parse::<ContestField>().unwrap(), ContestField::Title);
        assert_eq!("duration".parse::<ContestField>().unwrap(), ContestField::DurationInSecs);
        assert!("nope".parse::<ContestField>().is_err());
    }

    #[test]
    fn set_text_field_routes_by_name() {
        let mut rec = RawContestRecord::new("x");
        assert!(rec.set_text_field("key", "42".into()));
        assert!(rec.set_text_field("title", "Round".into()));
        assert!(!rec.set_text_field("rid", "5".into()));
        assert_eq!(rec.key.as_deref(), Some("42"));
        assert_eq!(rec.title, "Round");
    }

    #[test]
    fn extraction_serializes_as_tagged_variant() {
        let value = serde_json::to_value(Extraction::Regex("(?P<title>.+)".into())).unwrap();
        assert_eq!(value, json!({"regex": "(?P<title>.+)"}));
    }
}
