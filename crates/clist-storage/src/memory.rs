use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use clist_core::{Contest, ContestField, Resource};
use serde_json::Value as JsonValue;

use crate::store::{ContestStore, ContestWrite, PruneQuery, StoreError, WriteAction, WriteOutcome};

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<i64, Resource>,
    contests: BTreeMap<(i64, String), Contest>,
    dependents: BTreeMap<i64, Vec<String>>,
    locked: HashSet<(i64, String)>,
    next_id: i64,
}

/// In-process store with the same write semantics as the Postgres store. Keys can be
/// marked as locked to stand in for a concurrent transaction.
#[derive(Debug, Default)]
pub struct MemoryContestStore {
    state: Mutex<State>,
}

impl MemoryContestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(resources: impl IntoIterator<Item = Resource>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state();
            for resource in resources {
                state.resources.insert(resource.id, resource);
            }
        }
        store
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep using it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lock_key(&self, resource_id: i64, key: &str) {
        self.state().locked.insert((resource_id, key.to_string()));
    }

    pub fn unlock_key(&self, resource_id: i64, key: &str) {
        self.state().locked.remove(&(resource_id, key.to_string()));
    }

    /// Insert a row as-is, bypassing the upsert path.
    pub fn seed_contest(&self, mut contest: Contest) -> Contest {
        let mut state = self.state();
        state.next_id += 1;
        contest.id = state.next_id;
        state
            .contests
            .insert((contest.resource_id, contest.key.clone()), contest.clone());
        contest
    }

    /// Attach a dependent row (ranking, stage link) that must vanish with its contest.
    pub fn attach_dependent(&self, contest_id: i64, label: impl Into<String>) {
        self.state()
            .dependents
            .entry(contest_id)
            .or_default()
            .push(label.into());
    }

    pub fn dependents_of(&self, contest_id: i64) -> Vec<String> {
        self.state()
            .dependents
            .get(&contest_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contests(&self) -> Vec<Contest> {
        self.state().contests.values().cloned().collect()
    }

    pub fn contests_for(&self, resource_id: i64) -> Vec<Contest> {
        self.state()
            .contests
            .values()
            .filter(|c| c.resource_id == resource_id)
            .cloned()
            .collect()
    }
}

fn merge_info(existing: &mut JsonValue, update: &serde_json::Map<String, JsonValue>) {
    match existing {
        JsonValue::Object(map) => {
            for (k, v) in update {
                map.insert(k.clone(), v.clone());
            }
        }
        other => *other = JsonValue::Object(update.clone()),
    }
}

impl State {
    fn remove(&mut self, resource_id: i64, key: &str) -> Option<Contest> {
        let removed = self.contests.remove(&(resource_id, key.to_string()));
        if let Some(contest) = &removed {
            self.dependents.remove(&contest.id);
        }
        removed
    }

    fn is_locked(&self, resource_id: i64, key: &str) -> bool {
        self.locked.contains(&(resource_id, key.to_string()))
    }

    fn apply(&mut self, write: &ContestWrite) -> WriteOutcome {
        let rid = write.resource_id;
        if self.is_locked(rid, &write.key) {
            return WriteOutcome::Locked;
        }
        if let Some(old_key) = write.old_key.as_deref().filter(|k| *k != write.key) {
            if self.is_locked(rid, old_key) {
                return WriteOutcome::Locked;
            }
        }
        let current_exists = self.contests.contains_key(&(rid, write.key.clone()));

        if let Some(delete_key) = write.delete_key.as_deref().filter(|k| *k != write.key) {
            if !write.suppress_deletes {
                self.remove(rid, delete_key);
            }
        }

        let mut renamed = false;
        if let Some(old_key) = write.old_key.as_deref().filter(|k| *k != write.key) {
            if self.contests.contains_key(&(rid, old_key.to_string())) {
                if !current_exists {
                    if let Some(mut contest) = self.contests.remove(&(rid, old_key.to_string())) {
                        contest.key = write.key.clone();
                        self.contests.insert((rid, write.key.clone()), contest);
                        renamed = true;
                    }
                } else if !write.suppress_deletes {
                    self.remove(rid, old_key);
                }
            }
        }

        let upsert = match &write.action {
            WriteAction::Delete => {
                return WriteOutcome::Deleted {
                    existed: self.remove(rid, &write.key).is_some(),
                };
            }
            WriteAction::Upsert(upsert) => upsert,
        };

        if let Some(existing) = self.contests.get_mut(&(rid, write.key.clone())) {
            let keep_times = upsert.ignore_times_after_start && existing.start_time <= write.now;
            for field in ContestField::ALL {
                if !upsert.updates(field) || (keep_times && field.is_time()) {
                    continue;
                }
                match field {
                    ContestField::Title => existing.title = upsert.title.clone(),
                    ContestField::Url => existing.url = upsert.url.clone(),
                    ContestField::StandingsUrl => existing.standings_url = upsert.standings_url.clone(),
                    ContestField::StartTime => existing.start_time = upsert.start_time,
                    ContestField::EndTime => existing.end_time = upsert.end_time,
                    ContestField::DurationInSecs => existing.duration_in_secs = upsert.duration_in_secs,
                    ContestField::Slug => existing.slug = upsert.slug.clone(),
                    ContestField::TitlePath => existing.title_path = upsert.title_path.clone(),
                    ContestField::Info => merge_info(&mut existing.info, &upsert.info),
                }
            }
            existing.is_auto_added = true;
            existing.auto_updated = Some(write.now);
            return WriteOutcome::Updated { renamed };
        }

        self.next_id += 1;
        let contest = Contest {
            id: self.next_id,
            resource_id: rid,
            key: write.key.clone(),
            title: upsert.title.clone(),
            url: upsert.url.clone(),
            standings_url: upsert.standings_url.clone(),
            start_time: upsert.start_time,
            end_time: upsert.end_time,
            duration_in_secs: upsert.duration_in_secs,
            slug: upsert.slug.clone(),
            title_path: upsert.title_path.clone(),
            info: JsonValue::Object(upsert.info.clone()),
            is_auto_added: true,
            auto_updated: Some(write.now),
        };
        self.contests.insert((rid, write.key.clone()), contest);
        WriteOutcome::Inserted { renamed }
    }
}

#[async_trait]
impl ContestStore for MemoryContestStore {
    async fn load_resources(&self) -> Result<Vec<Resource>, StoreError> {
        Ok(self.state().resources.values().cloned().collect())
    }

    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let mut state = self.state();
        if state
            .resources
            .values()
            .any(|r| r.host == resource.host && r.id != resource.id)
        {
            return Err(StoreError::Integrity(format!(
                "duplicate resource host {}",
                resource.host
            )));
        }
        state.resources.insert(resource.id, resource.clone());
        Ok(())
    }

    async fn find_contest(&self, resource_id: i64, key: &str) -> Result<Option<Contest>, StoreError> {
        Ok(self
            .state()
            .contests
            .get(&(resource_id, key.to_string()))
            .cloned())
    }

    async fn apply(&self, write: &ContestWrite) -> Result<WriteOutcome, StoreError> {
        if let WriteAction::Upsert(upsert) = &write.action {
            if upsert.start_time > upsert.end_time {
                return Err(StoreError::Integrity(format!(
                    "contests_time_order violated for key {}",
                    write.key
                )));
            }
        }
        Ok(self.state().apply(write))
    }

    async fn prune_candidates(&self, query: &PruneQuery) -> Result<Vec<Contest>, StoreError> {
        let mut rows: Vec<Contest> = self
            .state()
            .contests
            .values()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        rows.sort_by_key(|c| (c.start_time, c.id));
        Ok(rows)
    }

    async fn delete_contests(&self, query: &PruneQuery, ids: &[i64]) -> Result<Vec<Contest>, StoreError> {
        let mut state = self.state();
        let keys: Vec<(i64, String)> = state
            .contests
            .iter()
            .filter(|(_, c)| ids.contains(&c.id) && query.matches(c))
            .filter(|((rid, key), _)| !state.is_locked(*rid, key))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys
            .iter()
            .filter_map(|(rid, key)| state.remove(*rid, key))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ContestUpsert;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn write(key: &str, title: &str, start: DateTime<Utc>) -> ContestWrite {
        ContestWrite {
            resource_id: 1,
            key: key.into(),
            old_key: None,
            delete_key: None,
            action: WriteAction::Upsert(ContestUpsert {
                title: title.into(),
                url: Some(format!("https://example.com/{key}")),
                standings_url: None,
                start_time: start,
                end_time: start + Duration::hours(2),
                duration_in_secs: 7200,
                slug: title.to_lowercase(),
                title_path: format!("example.com/2026/{}", title.to_lowercase()),
                info: json!({"round": 1}).as_object().cloned().unwrap(),
                unchanged: Default::default(),
                ignore_times_after_start: false,
            }),
            now: now(),
            suppress_deletes: false,
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_and_merges_info() {
        let store = MemoryContestStore::new();
        let start = now() + Duration::days(2);
        assert_eq!(
            store.apply(&write("a", "Alpha", start)).await.unwrap(),
            WriteOutcome::Inserted { renamed: false }
        );

        let mut second = write("a", "Alpha 2", start);
        if let WriteAction::Upsert(u) = &mut second.action {
            u.info = json!({"div": 2}).as_object().cloned().unwrap();
            u.unchanged.insert(ContestField::Url);
            u.url = Some("https://elsewhere".into());
        }
        assert_eq!(
            store.apply(&second).await.unwrap(),
            WriteOutcome::Updated { renamed: false }
        );

        let row = store.find_contest(1, "a").await.unwrap().unwrap();
        assert_eq!(row.title, "Alpha 2");
        assert_eq!(row.url.as_deref(), Some("https://example.com/a"));
        assert_eq!(row.info, json!({"round": 1, "div": 2}));
        assert_eq!(store.contests().len(), 1);
    }

    #[tokio::test]
    async fn old_key_renames_or_deletes() {
        let store = MemoryContestStore::new();
        let start = now() + Duration::days(2);
        store.apply(&write("old", "Alpha", start)).await.unwrap();

        let mut renamed = write("new", "Alpha", start);
        renamed.old_key = Some("old".into());
        assert_eq!(
            store.apply(&renamed).await.unwrap(),
            WriteOutcome::Updated { renamed: true }
        );
        assert!(store.find_contest(1, "old").await.unwrap().is_none());

        store.apply(&write("stale", "Beta", start)).await.unwrap();
        let mut collide = write("new", "Alpha", start);
        collide.old_key = Some("stale".into());
        store.apply(&collide).await.unwrap();
        assert!(store.find_contest(1, "stale").await.unwrap().is_none());
        assert_eq!(store.contests().len(), 1);
    }

    #[tokio::test]
    async fn suppressed_deletes_keep_collision_and_delete_key_rows() {
        let store = MemoryContestStore::new();
        let start = now() + Duration::days(2);
        for key in ["new", "stale", "mirror"] {
            store.apply(&write(key, key, start)).await.unwrap();
        }

        let mut debug = write("new", "Alpha", start);
        debug.old_key = Some("stale".into());
        debug.delete_key = Some("mirror".into());
        debug.suppress_deletes = true;
        assert_eq!(
            store.apply(&debug).await.unwrap(),
            WriteOutcome::Updated { renamed: false }
        );
        assert_eq!(store.contests().len(), 3);
        assert_eq!(store.find_contest(1, "new").await.unwrap().unwrap().title, "Alpha");

        debug.suppress_deletes = false;
        store.apply(&debug).await.unwrap();
        assert!(store.find_contest(1, "stale").await.unwrap().is_none());
        assert!(store.find_contest(1, "mirror").await.unwrap().is_none());
        assert_eq!(store.contests().len(), 1);
    }

    #[tokio::test]
    async fn locked_keys_defer_writes() {
        let store = MemoryContestStore::new();
        store.lock_key(1, "a");
        let outcome = store.apply(&write("a", "Alpha", now())).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Locked);
        assert!(store.contests().is_empty());
        store.unlock_key(1, "a");
        assert!(store.apply(&write("a", "Alpha", now())).await.unwrap().is_written());
    }

    #[tokio::test]
    async fn started_contests_keep_times_when_asked() {
        let store = MemoryContestStore::new();
        let start = now() - Duration::hours(1);
        store.apply(&write("a", "Alpha", start)).await.unwrap();

        let mut moved = write("a", "Alpha", start + Duration::hours(5));
        if let WriteAction::Upsert(u) = &mut moved.action {
            u.ignore_times_after_start = true;
        }
        store.apply(&moved).await.unwrap();
        let row = store.find_contest(1, "a").await.unwrap().unwrap();
        assert_eq!(row.start_time, start);
    }

    #[tokio::test]
    async fn delete_cascades_to_dependents() {
        let store = MemoryContestStore::new();
        store.apply(&write("a", "Alpha", now())).await.unwrap();
        let row = store.find_contest(1, "a").await.unwrap().unwrap();
        store.attach_dependent(row.id, "ranking:tourist");
        let deleted = store.delete_contests(&everything(), &[row.id]).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert!(store.dependents_of(row.id).is_empty());
    }

    fn everything() -> PruneQuery {
        PruneQuery {
            resource_id: 1,
            updated_before: now() + Duration::days(1),
            now: now() - Duration::days(30),
            auto_remove_started: true,
            skip_keys: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn delete_skips_rows_refreshed_or_locked_since_selection() {
        let store = MemoryContestStore::new();
        let start = now() + Duration::days(1);
        for key in ["a", "b", "c"] {
            let mut w = write(key, key, start);
            w.now = now() - Duration::hours(5);
            store.apply(&w).await.unwrap();
        }
        let query = PruneQuery {
            resource_id: 1,
            updated_before: now() - Duration::hours(3),
            now: now(),
            auto_remove_started: false,
            skip_keys: BTreeSet::new(),
        };
        let candidates = store.prune_candidates(&query).await.unwrap();
        assert_eq!(candidates.len(), 3);

        store.apply(&write("b", "b refreshed", start)).await.unwrap();
        store.lock_key(1, "c");

        let ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();
        let deleted = store.delete_contests(&query, &ids).await.unwrap();
        let keys: Vec<&str> = deleted.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a"]);
        assert!(store.find_contest(1, "b").await.unwrap().is_some());
        assert!(store.find_contest(1, "c").await.unwrap().is_some());
    }
}
