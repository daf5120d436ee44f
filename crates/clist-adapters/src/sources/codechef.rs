use async_trait::async_trait;
use clist_core::{JsonObject, RawContestRecord};
use clist_storage::{Fetch, FetchOptions};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::{json_str, json_string, AdapterError, ModuleContext, SourceModule};

const DEFAULT_API: &str = "https://www.codechef.com/api/list/contests";
const PAST_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, Default)]
pub struct CodeChef;

impl CodeChef {
    fn record(entry: &JsonValue, site: &str, section: &str) -> Option<RawContestRecord> {
        let code = json_string(entry, "contest_code")?;
        let name = json_string(entry, "contest_name")?;
        let site = site.trim_end_matches('/');

        let mut record = RawContestRecord::new(name);
        record.start_time = json_string(entry, "contest_start_date_iso");
        record.end_time = json_string(entry, "contest_end_date_iso");
        if record.end_time.is_none() {
            record.duration = json_string(entry, "contest_duration");
        }
        record.url = Some(format!("{site}/{code}"));
        record.standings_url = Some(format!("{site}/rankings/{code}"));
        record.key = Some(code);

        let mut info = JsonObject::new();
        info.insert("section".into(), json!(section));
        if let Some(participants) = entry.get("distinct_users").filter(|v| !v.is_null()) {
            info.insert("participants".into(), participants.clone());
        }
        record.info = Some(info);
        Some(record)
    }

    /// The `all` listing: present, future and the most recent past contests.
    pub fn parse_all(body: &str, site: &str) -> Result<Vec<RawContestRecord>, AdapterError> {
        let payload: JsonValue = serde_json::from_str(body)?;
        if json_str(&payload, "status") != Some("success") {
            return Err(AdapterError::Message("codechef contest listing was not successful".into()));
        }
        let mut out = Vec::new();
        for (field, section) in [
            ("present_contests", "present"),
            ("future_contests", "future"),
            ("past_contests", "past"),
        ] {
            let entries = payload.get(field).and_then(JsonValue::as_array);
            for entry in entries.into_iter().flatten() {
                match Self::record(entry, site, section) {
                    Some(record) => out.push(record),
                    None => warn!(entry = %entry, "codechef entry without code or name"),
                }
            }
        }
        Ok(out)
    }

    pub fn parse_past_page(body: &str, site: &str) -> Result<Vec<RawContestRecord>, AdapterError> {
        let payload: JsonValue = serde_json::from_str(body)?;
        let entries = payload.get("contests").and_then(JsonValue::as_array);
        Ok(entries
            .into_iter()
            .flatten()
            .filter_map(|entry| Self::record(entry, site, "past"))
            .collect())
    }
}

#[async_trait]
impl SourceModule for CodeChef {
    fn path(&self) -> &'static str {
        "codechef"
    }

    async fn extract(
        &self,
        fetch: &dyn Fetch,
        ctx: &ModuleContext,
    ) -> Result<Vec<RawContestRecord>, AdapterError> {
        let api = ctx.api_url.as_deref().unwrap_or(DEFAULT_API).trim_end_matches('/');
        let options = FetchOptions::cached();
        let all = fetch
            .fetch(&format!("{api}/all?sort_by=START&sorting_order=asc&offset=0&mode=all"), None, &options)
            .await?;
        let mut records = Self::parse_all(&all.body, &ctx.url)?;
        if !ctx.parse_full_list {
            return Ok(records);
        }

        let mut offset = 0usize;
        loop {
            let url = format!("{api}/past?sort_by=START&sorting_order=desc&offset={offset}&mode=all");
            let page = match fetch.fetch(&url, None, &options).await {
                Ok(resp) => Self::parse_past_page(&resp.body, &ctx.url),
                Err(err) => {
                    warn!(offset, error = %err, "stopping codechef past traversal");
                    break;
                }
            };
            let page = match page {
                Ok(page) if !page.is_empty() => page,
                Ok(_) => break,
                Err(err) => {
                    warn!(offset, error = %err, "malformed codechef past page");
                    break;
                }
            };
            debug!(offset, rows = page.len(), "codechef past page");
            records.extend(page);
            offset += PAST_PAGE_SIZE;
        }
        Ok(records)
    }
}
