use async_trait::async_trait;
use clist_core::{JsonObject, RawContestRecord};
use clist_storage::{Fetch, FetchOptions};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{json_i64, json_string, AdapterError, ModuleContext, SourceModule};

const DEFAULT_API: &str = "https://ctftime.org/api/v1/events/";

/// CTFtime event API. Events carry their own RFC 3339 start and finish.
#[derive(Debug, Clone, Copy, Default)]
pub struct CtfTime;

impl CtfTime {
    pub fn parse_events(body: &str) -> Result<Vec<RawContestRecord>, AdapterError> {
        let events: Vec<JsonValue> = serde_json::from_str(body)?;
        let mut out = Vec::with_capacity(events.len());
        for event in &events {
            let (Some(id), Some(title)) = (json_i64(event, "id"), json_string(event, "title")) else {
                warn!(event = %event, "ctftime event without id or title");
                continue;
            };
            let mut record = RawContestRecord::new(title);
            record.key = Some(id.to_string());
            record.start_time = json_string(event, "start");
            record.end_time = json_string(event, "finish");
            record.url = json_string(event, "ctftime_url")
                .or_else(|| Some(format!("https://ctftime.org/event/{id}/")));

            let mut info = JsonObject::new();
            for field in ["format", "onsite", "weight", "location", "url"] {
                match event.get(field) {
                    None | Some(JsonValue::Null) => {}
                    Some(JsonValue::String(s)) if s.trim().is_empty() => {}
                    Some(value) => {
                        let name = if field == "url" { "site_url" } else { field };
                        info.insert(name.to_string(), value.clone());
                    }
                }
            }
            record.info = Some(info);
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceModule for CtfTime {
    fn path(&self) -> &'static str {
        "ctftime"
    }

    async fn extract(
        &self,
        fetch: &dyn Fetch,
        ctx: &ModuleContext,
    ) -> Result<Vec<RawContestRecord>, AdapterError> {
        let api = ctx.api_url.as_deref().unwrap_or(DEFAULT_API);
        let limit = if ctx.parse_full_list { 1000 } else { 100 };
        let page = fetch
            .fetch(&format!("{api}?limit={limit}"), None, &FetchOptions::cached())
            .await?;
        Self::parse_events(&page.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, StaticFetch};
    use serde_json::json;

    const EVENTS: &str = r#"[
        {"id": 2240, "title": "DEF CON CTF Qualifier 2024", "start": "2024-05-04T00:00:00+00:00",
         "finish": "2024-05-06T00:00:00+00:00", "ctftime_url": "https://ctftime.org/event/2240/",
         "url": "https://nautilus.institute/", "format": "Jeopardy", "onsite": false, "weight": 49.5, "location": ""},
        {"id": 2241, "title": "  "}
    ]"#;

    #[test]
    fn parses_events_with_info() {
        let records = CtfTime::parse_events(EVENTS).unwrap();
        assert_eq!(records.len(), 1);
        let info = records[0].info.as_ref().unwrap();
        assert_eq!(info["site_url"], json!("https://nautilus.institute/"));
        assert_eq!(info["onsite"], json!(false));
        assert!(!info.contains_key("location"));
    }

    #[tokio::test]
    async fn limit_grows_for_full_list() {
        let fetch = StaticFetch::default().with("https://ctftime.org/api/v1/events/?limit=1000", EVENTS);
        let ctx = context("https://ctftime.org", "https://ctftime.org", true);
        assert_eq!(CtfTime.extract(&fetch, &ctx).await.unwrap().len(), 1);
    }

    #[test]
    fn non_array_payload_is_an_error() {
        assert!(matches!(CtfTime::parse_events("{}"), Err(AdapterError::Json(_))));
    }
}
