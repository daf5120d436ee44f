use async_trait::async_trait;
use clist_core::{JsonObject, RawContestRecord};
use clist_storage::{Fetch, FetchOptions};
use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::{json_i64, json_str, AdapterError, ModuleContext, SourceModule};

const DEFAULT_API: &str = "https://codeforces.com/api/contest.list";

/// Codeforces rounds from the public `contest.list` API. Gym contests are only pulled for full-list runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codeforces;

impl Codeforces {
    fn api_base<'a>(ctx: &'a ModuleContext) -> &'a str {
        ctx.api_url.as_deref().unwrap_or(DEFAULT_API)
    }

    pub fn parse_payload(body: &str, site: &str, gym: bool) -> Result<Vec<RawContestRecord>, AdapterError> {
        let payload: JsonValue = serde_json::from_str(body)?;
        if json_str(&payload, "status") != Some("OK") {
            let comment = json_str(&payload, "comment").unwrap_or("no comment");
            return Err(AdapterError::Message(format!("codeforces api refused: {comment}")));
        }
        let Some(entries) = payload.get("result").and_then(JsonValue::as_array) else {
            return Err(AdapterError::Message("codeforces api returned no result".into()));
        };

        let section = if gym { "gym" } else { "contest" };
        let site = site.trim_end_matches('/');
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let (Some(id), Some(name)) = (json_i64(entry, "id"), json_str(entry, "name")) else {
                warn!(entry = %entry, "codeforces entry without id or name");
                continue;
            };
            let Some(start) = json_i64(entry, "startTimeSeconds") else {
                // gym trainings without a schedule
                continue;
            };
            let duration = json_i64(entry, "durationSeconds").unwrap_or(0);

            let mut info = JsonObject::new();
            if let Some(phase) = json_str(entry, "phase") {
                info.insert("phase".into(), json!(phase));
            }
            if let Some(kind) = json_str(entry, "type") {
                info.insert("kind".into(), json!(kind));
            }
            if gym {
                info.insert("gym".into(), json!(true));
            }

            let mut record = RawContestRecord::new(name);
            record.key = Some(id.to_string());
            record.start_time = Some(start.to_string());
            record.end_time = Some((start + duration).to_string());
            record.url = Some(format!("{site}/{section}/{id}"));
            record.standings_url = Some(format!("{site}/{section}/{id}/standings"));
            record.info = Some(info);
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceModule for Codeforces {
    fn path(&self) -> &'static str {
        "codeforces"
    }

    async fn extract(
        &self,
        fetch: &dyn Fetch,
        ctx: &ModuleContext,
    ) -> Result<Vec<RawContestRecord>, AdapterError> {
        let base = Self::api_base(ctx);
        let page = fetch
            .fetch(&format!("{base}?gym=false"), None, &FetchOptions::cached())
            .await?;
        let mut records = Self::parse_payload(&page.body, &ctx.url, false)?;

        if ctx.parse_full_list {
            match fetch
                .fetch(&format!("{base}?gym=true"), None, &FetchOptions::cached())
                .await
            {
                Ok(page) => match Self::parse_payload(&page.body, &ctx.url, true) {
                    Ok(gym) => records.extend(gym),
                    Err(err) => warn!(error = %err, "skipping codeforces gym list"),
                },
                Err(err) => warn!(error = %err, "codeforces gym list unavailable"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, StaticFetch};

    const CONTEST_LIST: &str = r#"{
        "status": "OK",
        "result": [
            {"id": 1975, "name": "Codeforces Round 947 (Div. 1 + Div. 2)", "type": "CF", "phase": "BEFORE",
             "frozen": false, "durationSeconds": 9000, "startTimeSeconds": 1716734100},
            {"id": 1974, "name": "Codeforces Round 946 (Div. 3)", "type": "ICPC", "phase": "FINISHED",
             "frozen": false, "durationSeconds": 8100, "startTimeSeconds": 1716215700},
            {"id": 1973, "name": "Unscheduled", "type": "CF", "phase": "BEFORE", "durationSeconds": 7200},
            {"name": "broken"}
        ]
    }"#;

    #[test]
    fn parses_contest_list() {
        let records = Codeforces::parse_payload(CONTEST_LIST, "https://codeforces.com/", false).unwrap();
        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.key.as_deref(), Some("1975"));
        assert_eq!(first.start_time.as_deref(), Some("1716734100"));
        assert_eq!(first.end_time.as_deref(), Some("1716743100"));
        assert_eq!(first.url.as_deref(), Some("https://codeforces.com/contest/1975"));
        assert_eq!(first.info.as_ref().unwrap()["kind"], json!("CF"));
    }

    #[test]
    fn failed_status_is_an_error() {
        let err = Codeforces::parse_payload(r#"{"status":"FAILED","comment":"Call limit exceeded"}"#, "https://codeforces.com", false)
            .unwrap_err();
        assert!(err.to_string().contains("Call limit exceeded"));
    }

    #[tokio::test]
    async fn gym_only_fetched_for_full_list() {
        let fetch = StaticFetch::default()
            .with("https://codeforces.com/api/contest.list?gym=false", CONTEST_LIST)
            .with(
                "https://codeforces.com/api/contest.list?gym=true",
                r#"{"status":"OK","result":[{"id":105000,"name":"ICPC Training","startTimeSeconds":1700000000,"durationSeconds":18000}]}"#,
            );

        let bounded = context("https://codeforces.com", "https://codeforces.com", false);
        assert_eq!(Codeforces.extract(&fetch, &bounded).await.unwrap().len(), 2);

        let full = context("https://codeforces.com", "https://codeforces.com", true);
        let records = Codeforces.extract(&fetch, &full).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].url.as_deref(), Some("https://codeforces.com/gym/105000"));
    }

    #[tokio::test]
    async fn primary_fetch_failure_propagates() {
        let ctx = context("https://codeforces.com", "https://codeforces.com", false);
        assert!(matches!(
            Codeforces.extract(&StaticFetch::default(), &ctx).await,
            Err(AdapterError::Fetch(_))
        ));
    }
}
