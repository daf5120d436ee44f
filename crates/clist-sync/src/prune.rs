use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clist_core::Resource;
use clist_storage::{AuditKind, AuditLog, ContestStore, PruneQuery};
use serde::Serialize;
use tracing::{info, warn};

/// Auto-added rows untouched for this long are eligible for removal.
pub const PRUNE_GRACE_HOURS: i64 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneOutcome {
    pub candidates: Vec<String>,
    pub deleted: u64,
}

pub fn prune_query(resource: &Resource, skip_keys: BTreeSet<String>, now: DateTime<Utc>) -> PruneQuery {
    PruneQuery {
        resource_id: resource.id,
        updated_before: now - Duration::hours(PRUNE_GRACE_HOURS),
        now,
        auto_remove_started: resource.auto_remove_started,
        skip_keys,
    }
}

/// Removes contests the source stopped listing. Both snapshots go to the audit log; debug runs only log.
pub async fn prune_resource(
    store: &dyn ContestStore,
    audit: &AuditLog,
    resource: &Resource,
    skip_keys: BTreeSet<String>,
    now: DateTime<Utc>,
    debug: bool,
) -> Result<PruneOutcome> {
    let query = prune_query(resource, skip_keys, now);
    let candidates = store
        .prune_candidates(&query)
        .await
        .with_context(|| format!("selecting prune candidates for {}", resource.host))?;
    let mut outcome = PruneOutcome {
        candidates: candidates.iter().map(|c| c.key.clone()).collect(),
        deleted: 0,
    };
    if candidates.is_empty() {
        return Ok(outcome);
    }

    if debug {
        for contest in &candidates {
            info!(host = %resource.host, key = %contest.key, title = %contest.title, "would delete stale contest");
        }
        return Ok(outcome);
    }

    audit
        .append(AuditKind::ToDelete, resource, &candidates, Utc::now())
        .await
        .context("writing pre-delete audit snapshot")?;

    let ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
    let deleted = store
        .delete_contests(&query, &ids)
        .await
        .with_context(|| format!("deleting stale contests for {}", resource.host))?;
    outcome.deleted = deleted.len() as u64;
    if deleted.len() != ids.len() {
        warn!(
            host = %resource.host,
            expected = ids.len(),
            deleted = deleted.len(),
            "some prune candidates were refreshed, locked or already gone"
        );
    }

    if !deleted.is_empty() {
        audit
            .append(AuditKind::Deleted, resource, &deleted, Utc::now())
            .await
            .context("writing post-delete audit snapshot")?;
    }
    info!(host = %resource.host, deleted = outcome.deleted, "pruned stale contests");
    Ok(outcome)
}
