//! Source module contract, module registry and declarative regex extraction.

mod sources;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use clist_core::{RawContestRecord, Resource};
use clist_storage::{Fetch, FetchError, FetchOptions};
use regex::Regex;
use scraper::{ElementRef, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub use sources::{AtCoder, CodeChef, Codeforces, CtfTime, ICalFeed};

pub const CRATE_NAME: &str = "clist-adapters";

/// Page cap for paginated sources when a full historical traversal was not requested.
pub const BOUNDED_PAGES: usize = 3;

/// Read-only view of a resource handed to its source module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleContext {
    pub resource_id: i64,
    pub host: String,
    pub url: String,
    pub parse_url: String,
    pub api_url: Option<String>,
    pub timezone: String,
    pub parse_full_list: bool,
}

impl ModuleContext {
    pub fn for_resource(resource: &Resource, year: i32, parse_full_list: bool) -> Self {
        Self {
            resource_id: resource.id,
            host: resource.host.clone(),
            url: resource.url.clone(),
            parse_url: resource.parse_url_for_year(year),
            api_url: resource.api_url.clone(),
            timezone: resource.timezone.clone(),
            parse_full_list,
        }
    }

    pub fn page_limit(&self) -> Option<usize> {
        (!self.parse_full_list).then_some(BOUNDED_PAGES)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid extraction pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// One contest site. Implementations fetch through the collaborator and never touch the store.
#[async_trait]
pub trait SourceModule: Send + Sync {
    fn path(&self) -> &'static str;

    async fn extract(
        &self,
        fetch: &dyn Fetch,
        ctx: &ModuleContext,
    ) -> Result<Vec<RawContestRecord>, AdapterError>;
}

/// Declarative extraction: one named-capture regex run against one page.
#[derive(Debug, Clone)]
pub struct RegexExtractor {
    pattern: Regex,
}

impl RegexExtractor {
    pub fn new(pattern: &str) -> Result<Self, AdapterError> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().flatten().any(|name| name == "title") {
            return Err(AdapterError::Message(
                "extraction pattern has no `title` group".to_string(),
            ));
        }
        Ok(Self { pattern })
    }

    pub fn extract_from(&self, body: &str) -> Vec<RawContestRecord> {
        let names: Vec<&str> = self.pattern.capture_names().flatten().collect();
        let mut out = Vec::new();
        for caps in self.pattern.captures_iter(body) {
            let mut record = RawContestRecord::default();
            for name in &names {
                let Some(value) = caps.name(name).and_then(|m| text_or_none(m.as_str())) else {
                    continue;
                };
                if !record.set_text_field(name, value) {
                    warn!(group = *name, "ignoring capture group with no record field");
                }
            }
            if record.title.is_empty() {
                warn!(matched = &caps[0], "regex match without a title; skipped");
                continue;
            }
            out.push(record);
        }
        out
    }

    pub async fn extract(
        &self,
        fetch: &dyn Fetch,
        ctx: &ModuleContext,
    ) -> Result<Vec<RawContestRecord>, AdapterError> {
        let page = fetch
            .fetch(&ctx.parse_url, None, &FetchOptions::cached())
            .await?;
        Ok(self.extract_from(&page.body))
    }
}

/// Module path → implementation.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn SourceModule>>,
}

impl ModuleRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Codeforces));
        registry.register(Arc::new(AtCoder));
        registry.register(Arc::new(CodeChef));
        registry.register(Arc::new(CtfTime));
        registry.register(Arc::new(ICalFeed));
        registry
    }

    pub fn register(&mut self, module: Arc<dyn SourceModule>) -> &mut Self {
        self.modules.insert(module.path().to_string(), module);
        self
    }

    pub fn get(&self, path: &str) -> Option<Arc<dyn SourceModule>> {
        self.modules.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, field: &str) -> Option<&'a str> {
    value.get(field).and_then(JsonValue::as_str)
}

/// Integer field that some APIs send as a number and others as a string.
pub(crate) fn json_i64(value: &JsonValue, field: &str) -> Option<i64> {
    let v = value.get(field)?;
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

pub(crate) fn json_string(value: &JsonValue, field: &str) -> Option<String> {
    match value.get(field)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use clist_storage::{Fetch, FetchError, FetchOptions, FetchedResponse};

    /// Serves canned bodies by exact url; unknown urls answer 404.
    #[derive(Default)]
    pub struct StaticFetch {
        pages: HashMap<String, String>,
        pub requested: Mutex<Vec<String>>,
    }

    impl StaticFetch {
        pub fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }

        pub fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetch for StaticFetch {
        async fn fetch(
            &self,
            url: &str,
            _post: Option<&str>,
            _options: &FetchOptions,
        ) -> Result<FetchedResponse, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(body) => Ok(FetchedResponse {
                    status: 200,
                    final_url: url.to_string(),
                    headers: Default::default(),
                    body: body.clone(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    pub fn context(url: &str, parse_url: &str, parse_full_list: bool) -> super::ModuleContext {
        super::ModuleContext {
            resource_id: 1,
            host: "example.com".into(),
            url: url.into(),
            parse_url: parse_url.into(),
            api_url: None,
            timezone: "UTC".into(),
            parse_full_list,
        }
    }
}
