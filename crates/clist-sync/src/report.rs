use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clist_core::SkipReason;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

/// Counters for one resource over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub resource_id: i64,
    pub host: String,
    pub extracted: usize,
    pub duplicates: usize,
    pub inserted: usize,
    pub updated: usize,
    pub renamed: usize,
    pub deleted: usize,
    pub skipped: BTreeMap<String, usize>,
    pub prune_candidates: usize,
    pub pruned: u64,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ResourceStats {
    pub fn new(resource_id: i64, host: impl Into<String>) -> Self {
        Self {
            resource_id,
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn skip(&mut self, reason: &SkipReason) {
        *self.skipped.entry(reason.as_str().to_string()).or_default() += 1;
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub debug: bool,
    pub resources: Vec<ResourceStats>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn stats(&self, host: &str) -> Option<&ResourceStats> {
        self.resources.iter().find(|s| s.host == host)
    }

    pub fn failed(&self) -> usize {
        self.resources.iter().filter(|s| s.error.is_some()).count()
    }

    pub fn to_markdown(&self) -> String {
        let elapsed = (self.finished_at - self.started_at).num_milliseconds();
        let mut lines = vec![
            "# Contest Update Report".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {} ({elapsed} ms)", self.finished_at),
            format!("- Debug: {}", self.debug),
            format!("- Resources: {} ({} failed)", self.resources.len(), self.failed()),
            String::new(),
            "## Resources".to_string(),
            String::new(),
            "| host | extracted | dup | inserted | updated | deleted | skipped | pruned | ms |".to_string(),
            "|---|---|---|---|---|---|---|---|---|".to_string(),
        ];
        for s in &self.resources {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} | {} | {}/{} | {} |",
                s.host,
                s.extracted,
                s.duplicates,
                s.inserted,
                s.updated,
                s.deleted,
                s.skipped_total(),
                s.pruned,
                s.prune_candidates,
                s.elapsed_ms
            ));
        }

        let skips: Vec<String> = self
            .resources
            .iter()
            .flat_map(|s| {
                s.skipped
                    .iter()
                    .map(move |(reason, n)| format!("- {}: {reason} x{n}", s.host))
            })
            .collect();
        if !skips.is_empty() {
            lines.push(String::new());
            lines.push("## Skip Reasons".to_string());
            lines.extend(skips);
        }

        let errors: Vec<String> = self
            .resources
            .iter()
            .filter_map(|s| s.error.as_ref().map(|e| format!("- {}: {e}", s.host)))
            .chain(self.warnings.iter().map(|w| format!("- {w}")))
            .collect();
        if !errors.is_empty() {
            lines.push(String::new());
            lines.push("## Errors and Warnings".to_string());
            lines.extend(errors);
        }
        lines.push(String::new());
        lines.join("\n")
    }

    /// Writes `update_report.md` and `update_report.json` under `<root>/<run_id>/`.
    pub async fn write(&self, root: &Path) -> Result<PathBuf> {
        let dir = root.join(self.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        fs::write(dir.join("update_report.md"), self.to_markdown())
            .await
            .context("writing update_report.md")?;
        let json = serde_json::to_vec_pretty(self).context("serializing update report")?;
        fs::write(dir.join("update_report.json"), json)
            .await
            .context("writing update_report.json")?;
        Ok(dir)
    }
}
