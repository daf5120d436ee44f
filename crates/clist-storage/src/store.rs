use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clist_core::{Contest, ContestField, JsonObject, Resource};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("malformed row: {0}")]
    Decode(String),
}

/// Column values for an insert-or-update at `(resource_id, key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContestUpsert {
    pub title: String,
    pub url: Option<String>,
    pub standings_url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_in_secs: i64,
    pub slug: String,
    pub title_path: String,
    pub info: JsonObject,
    /// Columns left untouched when the row already exists.
    pub unchanged: BTreeSet<ContestField>,
    /// Keep stored times once the stored contest has started.
    pub ignore_times_after_start: bool,
}

impl ContestUpsert {
    pub fn updates(&self, field: ContestField) -> bool {
        !self.unchanged.contains(&field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteAction {
    Upsert(ContestUpsert),
    Delete,
}

/// Everything that happens to one `(resource_id, key)` in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ContestWrite {
    pub resource_id: i64,
    pub key: String,
    pub old_key: Option<String>,
    pub delete_key: Option<String>,
    pub action: WriteAction,
    pub now: DateTime<Utc>,
    /// Debug runs log deletions instead of executing them.
    pub suppress_deletes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted { renamed: bool },
    Updated { renamed: bool },
    Deleted { existed: bool },
    /// Another transaction holds the key; try again next run.
    Locked,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Inserted { .. } | WriteOutcome::Updated { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PruneQuery {
    pub resource_id: i64,
    pub updated_before: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Started-but-unfinished contests are candidates too.
    pub auto_remove_started: bool,
    pub skip_keys: BTreeSet<String>,
}

impl PruneQuery {
    pub fn matches(&self, contest: &Contest) -> bool {
        let pending = if self.auto_remove_started {
            contest.end_time > self.now
        } else {
            contest.start_time > self.now
        };
        contest.resource_id == self.resource_id
            && contest.is_auto_added
            && contest
                .auto_updated
                .is_some_and(|updated| updated < self.updated_before)
            && pending
            && !self.skip_keys.contains(&contest.key)
    }
}

#[async_trait]
pub trait ContestStore: Send + Sync {
    async fn load_resources(&self) -> Result<Vec<Resource>, StoreError>;

    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StoreError>;

    async fn find_contest(&self, resource_id: i64, key: &str) -> Result<Option<Contest>, StoreError>;

    async fn apply(&self, write: &ContestWrite) -> Result<WriteOutcome, StoreError>;

    async fn prune_candidates(&self, query: &PruneQuery) -> Result<Vec<Contest>, StoreError>;

    /// Deletes the given candidates that still match `query` and are not locked elsewhere;
    /// dependent rows go with them. Returns the rows actually removed.
    async fn delete_contests(&self, query: &PruneQuery, ids: &[i64]) -> Result<Vec<Contest>, StoreError>;
}
