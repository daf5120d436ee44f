use async_trait::async_trait;
use clist_core::RawContestRecord;
use clist_storage::{Fetch, FetchOptions};
use scraper::Html;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::{element_text, selector, AdapterError, ModuleContext, SourceModule};

/// AtCoder schedule tables: running and upcoming contests on the index page, then the paginated archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtCoder;

/// Tables on the contests index, in the order they are read.
const INDEX_TABLES: &[&str] = &["#contest-table-action", "#contest-table-upcoming"];

impl AtCoder {
    /// Rows of every matched table as raw records. `Html` is not `Send`, so parsing stays synchronous.
    pub fn parse_tables(body: &str, base: &Url, tables: &[&str]) -> Result<Vec<RawContestRecord>, AdapterError> {
        let document = Html::parse_document(body);
        let row_sel = selector("tbody tr")?;
        let cell_sel = selector("td")?;
        let link_sel = selector("a[href^='/contests/']")?;
        let time_sel = selector("time")?;

        let mut out = Vec::new();
        for table in tables {
            let table_sel = selector(table)?;
            for container in document.select(&table_sel) {
                for row in container.select(&row_sel) {
                    let cells: Vec<_> = row.select(&cell_sel).collect();
                    if cells.len() < 3 {
                        continue;
                    }
                    let Some(link) = cells[1].select(&link_sel).next() else {
                        warn!("atcoder row without contest link");
                        continue;
                    };
                    let (Some(title), Some(href)) = (element_text(link), link.value().attr("href")) else {
                        continue;
                    };
                    let start = cells[0]
                        .select(&time_sel)
                        .next()
                        .and_then(element_text)
                        .or_else(|| element_text(cells[0]));
                    let Ok(url) = base.join(href) else {
                        warn!(href, "unresolvable atcoder contest link");
                        continue;
                    };
                    let key = url
                        .path_segments()
                        .and_then(|mut segments| segments.nth(1).map(str::to_string))
                        .filter(|k| !k.is_empty());

                    let mut record = RawContestRecord::new(title);
                    record.key = key;
                    record.start_time = start;
                    record.duration = element_text(cells[2]);
                    record.standings_url = Some(format!("{}/standings", url.as_str().trim_end_matches('/')));
                    record.url = Some(url.to_string());
                    if let Some(rated) = cells.get(3).and_then(|c| element_text(*c)) {
                        record.info = Some([("rated".to_string(), json!(rated))].into_iter().collect());
                    }
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    fn base(ctx: &ModuleContext) -> Result<Url, AdapterError> {
        Url::parse(&ctx.url).map_err(|e| AdapterError::Message(format!("bad atcoder url {}: {e}", ctx.url)))
    }
}

#[async_trait]
impl SourceModule for AtCoder {
    fn path(&self) -> &'static str {
        "atcoder"
    }

    async fn extract(
        &self,
        fetch: &dyn Fetch,
        ctx: &ModuleContext,
    ) -> Result<Vec<RawContestRecord>, AdapterError> {
        let base = Self::base(ctx)?;
        let options = FetchOptions::cached().with_header("Accept-Language", "en");
        let index = fetch.fetch(&ctx.parse_url, None, &options).await?;
        let mut records = Self::parse_tables(&index.body, &base, INDEX_TABLES)?;

        let limit = ctx.page_limit();
        let mut page = 1usize;
        while limit.map_or(true, |max| page <= max) {
            let url = format!("{}/contests/archive?page={page}", base.as_str().trim_end_matches('/'));
            let body = match fetch.fetch(&url, None, &options).await {
                Ok(resp) => resp.body,
                Err(err) => {
                    warn!(page, error = %err, "stopping atcoder archive traversal");
                    break;
                }
            };
            let rows = Self::parse_tables(&body, &base, &[".table-responsive"])?;
            if rows.is_empty() {
                break;
            }
            debug!(page, rows = rows.len(), "atcoder archive page");
            records.extend(rows);
            page += 1;
        }
        Ok(records)
    }
}
