use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clist_core::{Contest, Resource};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Which snapshot of a pruning pass is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    ToDelete,
    Deleted,
}

impl AuditKind {
    fn suffix(&self) -> &'static str {
        match self {
            AuditKind::ToDelete => "to_delete",
            AuditKind::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub logged_at: DateTime<Utc>,
    pub resource_id: i64,
    pub host: String,
    pub contests: Vec<Contest>,
}

/// Per-run YAML files holding full rows before and after deletion.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    stamp: String,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, run_started: DateTime<Utc>) -> Self {
        Self {
            dir: dir.into(),
            stamp: run_started.format("%Y%m%d_%H%M%S").to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: AuditKind) -> PathBuf {
        self.dir.join(format!("{}.{}.yaml", self.stamp, kind.suffix()))
    }

    pub async fn append(
        &self,
        kind: AuditKind,
        resource: &Resource,
        contests: &[Contest],
        logged_at: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        let path = self.path_for(kind);
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating audit directory {}", self.dir.display()))?;

        let entry = AuditEntry {
            logged_at,
            resource_id: resource.id,
            host: resource.host.clone(),
            contests: contests.to_vec(),
        };
        let mut doc = String::from("---\n");
        doc.push_str(&serde_yaml::to_string(&entry).context("serializing audit entry")?);

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening audit log {}", path.display()))?;
        file.write_all(doc.as_bytes())
            .await
            .with_context(|| format!("writing audit log {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing audit log {}", path.display()))?;
        Ok(path)
    }
}
