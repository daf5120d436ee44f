//! Resource routing, key synthesis and in-run deduplication.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Datelike;
use clist_core::{ContestField, JsonObject, NormalizedContest, Quirks, RawContestRecord, Resource, SkipReason};
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::normalize::normalize_times;
use crate::text::{clean_title, slugify};

/// Resources addressable by id and by host, with their parsed quirks.
#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    by_id: BTreeMap<i64, Resource>,
    by_host: HashMap<String, i64>,
    quirks: BTreeMap<i64, ResolvedQuirks>,
}

/// Quirks with the title pattern compiled once per resource.
#[derive(Debug, Clone, Default)]
pub struct ResolvedQuirks {
    pub archive_only: bool,
    pub key_from_url: bool,
    pub strip_title: Option<Regex>,
}

impl ResolvedQuirks {
    pub fn resolve(quirks: &Quirks) -> Result<Self, regex::Error> {
        Ok(Self {
            archive_only: quirks.archive_only,
            key_from_url: quirks.key_from_url,
            strip_title: quirks.strip_title.as_deref().map(Regex::new).transpose()?,
        })
    }
}

impl ResourceIndex {
    pub fn new(resources: impl IntoIterator<Item = Resource>) -> Self {
        let mut index = Self::default();
        for resource in resources {
            let quirks = resource
                .quirks()
                .map_err(|e| e.to_string())
                .and_then(|q| ResolvedQuirks::resolve(&q).map_err(|e| e.to_string()))
                .unwrap_or_else(|err| {
                    warn!(host = %resource.host, error = %err, "ignoring malformed resource quirks");
                    ResolvedQuirks::default()
                });
            index.by_host.insert(resource.host.to_ascii_lowercase(), resource.id);
            index.quirks.insert(resource.id, quirks);
            index.by_id.insert(resource.id, resource);
        }
        index
    }

    pub fn get(&self, id: i64) -> Option<&Resource> {
        self.by_id.get(&id)
    }

    pub fn by_host(&self, host: &str) -> Option<&Resource> {
        self.by_host
            .get(&host.trim().to_ascii_lowercase())
            .and_then(|id| self.by_id.get(id))
    }

    pub fn quirks(&self, id: i64) -> ResolvedQuirks {
        self.quirks.get(&id).cloned().unwrap_or_default()
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.by_id.values()
    }

    /// A record's `rid` or `host` routes it to another resource; otherwise it stays with its source.
    pub fn route<'a>(&'a self, record: &RawContestRecord, source: &'a Resource) -> Result<&'a Resource, SkipReason> {
        if let Some(rid) = record.rid {
            return self
                .get(rid)
                .ok_or_else(|| SkipReason::UnknownResource(format!("rid {rid}")));
        }
        match record.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            Some(host) if !host.eq_ignore_ascii_case(&source.host) => self
                .by_host(host)
                .ok_or_else(|| SkipReason::UnknownResource(format!("host {host}"))),
            _ => Ok(source),
        }
    }
}

pub fn parse_unchanged(names: &[String]) -> BTreeSet<ContestField> {
    names
        .iter()
        .filter_map(|name| match name.parse::<ContestField>() {
            Ok(field) => Some(field),
            Err(err) => {
                warn!(error = %err, "ignoring unchanged field");
                None
            }
        })
        .collect()
}

/// Turns one raw record into a normalized contest bound to its resource.
pub fn normalize_record(
    record: RawContestRecord,
    source: &Resource,
    index: &ResourceIndex,
) -> Result<NormalizedContest, SkipReason> {
    let resource = index.route(&record, source)?;
    let quirks = index.quirks(resource.id);

    let mut title = clean_title(&record.title);
    if let Some(strip) = &quirks.strip_title {
        title = clean_title(&strip.replace_all(&title, " "));
    }
    if title.is_empty() {
        return Err(SkipReason::MissingTitle);
    }

    let times = normalize_times(&record, &resource.timezone)?;
    let year = times.start.year();

    let key = match record.key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => key.to_string(),
        None => match record.url.as_deref().filter(|_| quirks.key_from_url) {
            Some(url) => url.trim().to_string(),
            None => format!("{year} {title}"),
        },
    };
    let slug = match slugify(&title) {
        slug if slug.is_empty() => slugify(&key),
        slug => slug,
    };
    let title_path = format!("{}/{}/{}", resource.host, year, slug);

    Ok(NormalizedContest {
        resource_id: resource.id,
        key,
        title,
        url: record.url,
        standings_url: record.standings_url,
        start_time: times.start,
        end_time: times.end,
        duration_secs: times.duration_secs,
        slug,
        title_path,
        info: record.info.unwrap_or_default(),
        old_key: record.old_key.filter(|k| !k.trim().is_empty()),
        delete_key: record.delete_key.filter(|k| !k.trim().is_empty()),
        skip_check_time: record.skip_check_time,
        skip_update_key: record.skip_update_key,
        ignore_times_after_start: record.ignore_times_after_start,
        delete_after_end: record.delete_after_end,
        inherit_stage: record.inherit_stage,
        duplicate: record.duplicate,
        unchanged: parse_unchanged(&record.unchanged),
    })
}

/// Recursive object merge; `update` wins on conflicting leaves.
pub fn deep_merge(base: &mut JsonObject, update: JsonObject) {
    for (key, value) in update {
        match (base.get_mut(&key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn merge_into(earlier: &mut NormalizedContest, later: NormalizedContest) {
    earlier.title = later.title;
    earlier.slug = later.slug;
    earlier.title_path = later.title_path;
    earlier.start_time = later.start_time;
    earlier.end_time = later.end_time;
    // times always come from the later record, so its duration does too
    earlier.duration_secs = later.duration_secs;
    if later.url.is_some() {
        earlier.url = later.url;
    }
    if later.standings_url.is_some() {
        earlier.standings_url = later.standings_url;
    }
    if later.old_key.is_some() {
        earlier.old_key = later.old_key;
    }
    if later.delete_key.is_some() {
        earlier.delete_key = later.delete_key;
    }
    deep_merge(&mut earlier.info, later.info);
    earlier.skip_check_time |= later.skip_check_time;
    earlier.skip_update_key |= later.skip_update_key;
    earlier.ignore_times_after_start |= later.ignore_times_after_start;
    earlier.delete_after_end |= later.delete_after_end;
    earlier.inherit_stage |= later.inherit_stage;
    earlier.unchanged.extend(later.unchanged);
    earlier.duplicate = true;
}

/// Collapses contests sharing `(resource_id, key)` into the first occurrence's slot.
pub fn dedup(contests: Vec<NormalizedContest>) -> (Vec<NormalizedContest>, usize) {
    let mut slots: HashMap<(i64, String), usize> = HashMap::new();
    let mut out: Vec<NormalizedContest> = Vec::with_capacity(contests.len());
    let mut merged = 0;
    for contest in contests {
        let id = (contest.resource_id, contest.key.clone());
        match slots.get(&id) {
            Some(&slot) => {
                merge_into(&mut out[slot], contest);
                merged += 1;
            }
            None => {
                slots.insert(id, out.len());
                out.push(contest);
            }
        }
    }
    (out, merged)
}
