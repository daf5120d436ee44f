use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use clist_adapters::{AdapterError, ModuleContext, ModuleRegistry, SourceModule};
use clist_core::{Contest, Extraction, RawContestRecord, Resource};
use clist_storage::{
    AuditKind, AuditLog, ContestStore, Fetch, FetchError, FetchOptions, FetchedResponse, MemoryContestStore,
};
use clist_sync::{RunReport, SyncConfig, SyncPipeline, UpdateParams};
use serde_json::json;
use tempfile::{tempdir, TempDir};

struct StaticModule {
    path: &'static str,
    records: Vec<RawContestRecord>,
    delay: Option<StdDuration>,
}

#[async_trait]
impl SourceModule for StaticModule {
    fn path(&self) -> &'static str {
        self.path
    }

    async fn extract(&self, _fetch: &dyn Fetch, _ctx: &ModuleContext) -> Result<Vec<RawContestRecord>, AdapterError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.records.clone())
    }
}

#[derive(Default)]
struct StaticFetch {
    pages: HashMap<String, String>,
}

#[async_trait]
impl Fetch for StaticFetch {
    async fn fetch(&self, url: &str, _post: Option<&str>, _options: &FetchOptions) -> Result<FetchedResponse, FetchError> {
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

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().unwrap()
}

fn resource(id: i64, host: &str, module: &str) -> Resource {
    Resource {
        id,
        host: host.into(),
        url: format!("https://{host}"),
        parse_url: None,
        api_url: None,
        extraction: Extraction::Module(module.into()),
        timezone: "UTC".into(),
        enabled: true,
        auto_remove_started: false,
        info: json!({}),
    }
}

fn record(key: &str, title: &str, start: &str, duration: &str) -> RawContestRecord {
    let mut r = RawContestRecord::new(title);
    r.key = Some(key.into());
    r.start_time = Some(start.into());
    r.duration = Some(duration.into());
    r
}

fn config(root: &Path, source_timeout_secs: u64) -> SyncConfig {
    SyncConfig {
        database_url: String::new(),
        cache_dir: None,
        cache_ttl_secs: 0,
        audit_dir: root.join("audit"),
        reports_dir: root.join("reports"),
        user_agent: "clist-test".into(),
        http_timeout_secs: 5,
        source_timeout_secs,
        workers: 4,
        scheduler_enabled: false,
        update_cron: "0 0 * * * *".into(),
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<MemoryContestStore>,
    pipeline: SyncPipeline,
}

fn harness(resources: Vec<Resource>, modules: Vec<StaticModule>, fetch: StaticFetch, source_timeout_secs: u64) -> Harness {
    let dir = tempdir().expect("tempdir");
    let store = Arc::new(MemoryContestStore::with_resources(resources));
    let mut registry = ModuleRegistry::empty();
    for module in modules {
        registry.register(Arc::new(module));
    }
    let pipeline = SyncPipeline::new(config(dir.path(), source_timeout_secs), store.clone(), Arc::new(fetch))
        .with_registry(registry);
    Harness { dir, store, pipeline }
}

fn module(path: &'static str, records: Vec<RawContestRecord>) -> StaticModule {
    StaticModule {
        path,
        records,
        delay: None,
    }
}

fn seeded(resource_id: i64, key: &str, start: DateTime<Utc>, updated: DateTime<Utc>) -> Contest {
    Contest {
        id: 0,
        resource_id,
        key: key.into(),
        title: key.into(),
        url: None,
        standings_url: None,
        start_time: start,
        end_time: start + Duration::hours(2),
        duration_in_secs: 7200,
        slug: key.into(),
        title_path: format!("seed/{key}"),
        info: json!({}),
        is_auto_added: true,
        auto_updated: Some(updated),
    }
}

async fn run(h: &Harness, params: UpdateParams) -> RunReport {
    h.pipeline.run_at(params, now()).await.expect("update run")
}

#[tokio::test]
async fn finals_end_time_is_derived_from_duration() {
    let h = harness(
        vec![resource(5, "example.com", "static")],
        vec![module("static", vec![record("123", "Finals", "2024-05-01 10:00", "05:00")])],
        StaticFetch::default(),
        30,
    );
    let report = run(&h, UpdateParams::default()).await;

    let row = h.store.find_contest(5, "123").await.unwrap().expect("stored");
    assert_eq!(row.start_time, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().unwrap());
    assert_eq!(row.end_time, Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).single().unwrap());
    assert_eq!(row.duration_in_secs, 18_000);
    assert_eq!(row.title_path, "example.com/2024/finals");
    assert!(row.is_auto_added);
    assert_eq!(row.auto_updated, Some(now()));

    let stats = report.stats("example.com").unwrap();
    assert_eq!((stats.extracted, stats.inserted), (1, 1));
    assert!(h.dir.path().join("reports").join(report.run_id.to_string()).join("update_report.md").exists());
}

#[tokio::test]
async fn rerun_with_same_input_changes_nothing() {
    let records = vec![
        record("a", "Round A", "2024-05-02 10:00", "2h"),
        record("b", "Round B", "2024-05-03 10:00", "2h"),
    ];
    let h = harness(vec![resource(1, "example.com", "static")], vec![module("static", records)], StaticFetch::default(), 30);

    run(&h, UpdateParams::default()).await;
    let first = h.store.contests();
    let report = run(&h, UpdateParams::default()).await;
    let second = h.store.contests();

    assert_eq!(first, second);
    let stats = report.stats("example.com").unwrap();
    assert_eq!((stats.inserted, stats.updated, stats.pruned), (0, 2, 0));
}

#[tokio::test]
async fn old_key_renames_existing_row() {
    let mut renamed = record("new", "Cup", "2024-05-02 10:00", "2h");
    renamed.old_key = Some("old".into());
    let h = harness(vec![resource(1, "example.com", "static")], vec![module("static", vec![renamed])], StaticFetch::default(), 30);
    let original = h.store.seed_contest(seeded(1, "old", now() + Duration::days(1), now()));

    let report = run(&h, UpdateParams::default()).await;

    assert!(h.store.find_contest(1, "old").await.unwrap().is_none());
    let row = h.store.find_contest(1, "new").await.unwrap().unwrap();
    assert_eq!(row.id, original.id);
    assert_eq!(row.title, "Cup");
    assert_eq!(h.store.contests().len(), 1);
    assert_eq!(report.stats("example.com").unwrap().renamed, 1);
}

#[tokio::test]
async fn slow_source_times_out_without_touching_its_rows() {
    let slow = StaticModule {
        path: "slow",
        records: vec![record("x", "Never", "2024-05-02 10:00", "2h")],
        delay: Some(StdDuration::from_secs(30)),
    };
    let fast = module("fast", vec![record("ok", "Open Round", "2024-05-02 10:00", "2h")]);
    let h = harness(
        vec![resource(1, "slow.example", "slow"), resource(2, "fast.example", "fast")],
        vec![slow, fast],
        StaticFetch::default(),
        1,
    );
    h.store.seed_contest(seeded(1, "kept", now() + Duration::days(2), now() - Duration::hours(10)));

    let report = run(&h, UpdateParams::default()).await;

    let slow_stats = report.stats("slow.example").unwrap();
    assert_eq!(slow_stats.extracted, 0);
    assert!(slow_stats.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(h.store.contests_for(1).len(), 1);
    assert!(h.store.find_contest(2, "ok").await.unwrap().is_some());
    assert_eq!(report.failed(), 1);
}

#[tokio::test]
async fn stale_contests_are_skipped_unless_time_checks_are_off() {
    let old = record("old", "Ancient Cup", "2024-03-01 10:00", "2h");
    let h = harness(vec![resource(1, "example.com", "static")], vec![module("static", vec![old])], StaticFetch::default(), 30);

    let report = run(&h, UpdateParams::default()).await;
    assert!(h.store.contests().is_empty());
    assert_eq!(report.stats("example.com").unwrap().skipped.get("stale"), Some(&1));

    run(&h, UpdateParams { skip_check_time: true, ..Default::default() }).await;
    assert!(h.store.find_contest(1, "old").await.unwrap().is_some());
}

#[tokio::test]
async fn archive_only_resources_ignore_staleness() {
    let mut archive = resource(1, "stats.example", "static");
    archive.info = json!({"quirks": {"archive_only": true}});
    let h = harness(
        vec![archive],
        vec![module("static", vec![record("1998", "Olympiad 1998", "1998-07-10 09:00", "5h")])],
        StaticFetch::default(),
        30,
    );
    run(&h, UpdateParams::default()).await;
    assert!(h.store.find_contest(1, "1998").await.unwrap().is_some());
}

#[tokio::test]
async fn later_duplicate_wins() {
    let mut first = record("cup", "Cup", "2024-05-02 10:00", "2h");
    first.info = json!({"division": 1, "sponsor": "acme"}).as_object().cloned();
    let mut second = record("cup", "Cup (rescheduled)", "2024-05-02 12:00", "2h");
    second.info = json!({"division": 2}).as_object().cloned();
    let h = harness(
        vec![resource(1, "example.com", "static")],
        vec![module("static", vec![first, second])],
        StaticFetch::default(),
        30,
    );

    let report = run(&h, UpdateParams::default()).await;

    let rows = h.store.contests();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].title, "Cup (rescheduled)");
    assert_eq!(rows[0].start_time, Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).single().unwrap());
    assert_eq!(rows[0].info, json!({"division": 2, "sponsor": "acme"}));
    assert_eq!(report.stats("example.com").unwrap().duplicates, 1);
}

#[tokio::test]
async fn locked_key_is_deferred_and_protected_from_pruning() {
    let h = harness(
        vec![resource(1, "example.com", "static")],
        vec![module(
            "static",
            vec![
                record("busy", "Busy Round", "2024-05-02 10:00", "2h"),
                record("free", "Free Round", "2024-05-03 10:00", "2h"),
            ],
        )],
        StaticFetch::default(),
        30,
    );
    let busy = h.store.seed_contest(seeded(1, "busy", now() + Duration::days(1), now() - Duration::hours(10)));
    h.store.lock_key(1, "busy");

    let report = run(&h, UpdateParams::default()).await;

    let stats = report.stats("example.com").unwrap();
    assert_eq!(stats.skipped.get("locked"), Some(&1));
    assert_eq!(stats.pruned, 0);
    let row = h.store.find_contest(1, "busy").await.unwrap().unwrap();
    assert_eq!(row.title, busy.title);
    assert!(h.store.find_contest(1, "free").await.unwrap().is_some());
}

#[tokio::test]
async fn vanished_contests_are_pruned_with_audit_trail() {
    let h = harness(
        vec![resource(1, "example.com", "static")],
        vec![module("static", vec![record("kept", "Kept Round", "2024-05-02 10:00", "2h")])],
        StaticFetch::default(),
        30,
    );
    let gone = h.store.seed_contest(seeded(1, "gone", now() + Duration::days(3), now() - Duration::hours(5)));
    h.store.attach_dependent(gone.id, "ranking:1");
    h.store.seed_contest(seeded(1, "recent", now() + Duration::days(3), now() - Duration::hours(1)));
    h.store.seed_contest(seeded(1, "finished", now() - Duration::days(3), now() - Duration::hours(5)));

    let debug = run(&h, UpdateParams { debug: true, ..Default::default() }).await;
    assert_eq!(debug.stats("example.com").unwrap().prune_candidates, 1);
    assert!(h.store.find_contest(1, "gone").await.unwrap().is_some());

    let report = run(&h, UpdateParams::default()).await;
    assert_eq!(report.stats("example.com").unwrap().pruned, 1);
    assert!(h.store.find_contest(1, "gone").await.unwrap().is_none());
    assert!(h.store.dependents_of(gone.id).is_empty());
    assert!(h.store.find_contest(1, "recent").await.unwrap().is_some());
    assert!(h.store.find_contest(1, "finished").await.unwrap().is_some());

    let audit = AuditLog::new(h.dir.path().join("audit"), now());
    let snapshot = std::fs::read_to_string(audit.path_for(AuditKind::Deleted)).unwrap();
    assert!(snapshot.contains("key: gone"));
    assert!(audit.path_for(AuditKind::ToDelete).exists());
}

#[tokio::test]
async fn skip_update_key_protects_the_row() {
    let mut keep = record("frozen", "Frozen Round", "2024-05-02 10:00", "2h");
    keep.skip_update_key = true;
    let h = harness(
        vec![resource(1, "example.com", "static")],
        vec![module("static", vec![keep, record("live", "Live Round", "2024-05-03 10:00", "2h")])],
        StaticFetch::default(),
        30,
    );
    h.store.seed_contest(seeded(1, "frozen", now() + Duration::days(1), now() - Duration::hours(10)));

    let report = run(&h, UpdateParams::default()).await;

    let row = h.store.find_contest(1, "frozen").await.unwrap().unwrap();
    assert_eq!(row.title, "frozen");
    assert_eq!(report.stats("example.com").unwrap().skipped.get("skip_update_key"), Some(&1));
}

#[tokio::test]
async fn regex_resources_extract_from_year_page() {
    let mut site = resource(3, "olymp.example", "unused");
    site.extraction = Extraction::Regex(
        r"<li>(?P<title>[^|]+)\|(?P<start_time>[^|]+)\|(?P<duration>[^<]+)</li>".into(),
    );
    site.parse_url = Some("https://olymp.example/${YEAR}/schedule".into());
    site.timezone = "Europe/Moscow".into();
    let fetch = StaticFetch {
        pages: HashMap::from([(
            "https://olymp.example/2024/schedule".to_string(),
            "<ul><li>Spring Olympiad|01.05.2024 13:00|5 hours</li><li>Bad|someday|1h</li></ul>".to_string(),
        )]),
    };
    let h = harness(vec![site], vec![], fetch, 30);

    let report = run(&h, UpdateParams::default()).await;

    let row = h.store.find_contest(3, "2024 Spring Olympiad").await.unwrap().unwrap();
    assert_eq!(row.start_time, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().unwrap());
    assert_eq!(row.duration_in_secs, 18_000);
    let stats = report.stats("olymp.example").unwrap();
    assert_eq!(stats.extracted, 2);
    assert_eq!(stats.skipped.get("invalid_time"), Some(&1));
}

#[tokio::test]
async fn failed_extraction_prevents_pruning() {
    let h = harness(vec![resource(1, "example.com", "missing")], vec![], StaticFetch::default(), 30);
    h.store.seed_contest(seeded(1, "upcoming", now() + Duration::days(2), now() - Duration::hours(10)));

    let report = run(&h, UpdateParams::default()).await;

    assert!(report.stats("example.com").unwrap().error.is_some());
    assert_eq!(h.store.contests().len(), 1);
}

#[tokio::test]
async fn malformed_duration_is_dropped_without_affecting_other_sources() {
    let h = harness(
        vec![resource(1, "bad.example", "bad"), resource(2, "good.example", "good")],
        vec![
            module(
                "bad",
                vec![
                    record("inf", "Endless", "2024-05-02 10:00", "inf"),
                    record("huge", "Huge", "2024-05-02 10:00", "999999999999"),
                    record("fine", "Fine", "2024-05-02 10:00", "2h"),
                ],
            ),
            module("good", vec![record("ok", "Open Round", "2024-05-02 10:00", "2h")]),
        ],
        StaticFetch::default(),
        30,
    );

    let report = run(&h, UpdateParams::default()).await;

    let bad = report.stats("bad.example").unwrap();
    assert_eq!(bad.skipped.get("invalid_time"), Some(&2));
    assert_eq!(bad.inserted, 1);
    assert!(h.store.find_contest(1, "inf").await.unwrap().is_none());
    assert!(h.store.find_contest(2, "ok").await.unwrap().is_some());
}

#[tokio::test]
async fn delete_key_removes_the_named_row_outside_debug() {
    let mut merged = record("main", "Main Round", "2024-05-02 10:00", "2h");
    merged.delete_key = Some("mirror".into());
    let h = harness(
        vec![resource(1, "example.com", "static")],
        vec![module("static", vec![merged])],
        StaticFetch::default(),
        30,
    );
    h.store.seed_contest(seeded(1, "mirror", now() + Duration::days(1), now() - Duration::hours(1)));

    run(&h, UpdateParams { debug: true, ..Default::default() }).await;
    assert!(h.store.find_contest(1, "mirror").await.unwrap().is_some());
    assert!(h.store.find_contest(1, "main").await.unwrap().is_some());

    run(&h, UpdateParams::default()).await;
    assert!(h.store.find_contest(1, "mirror").await.unwrap().is_none());
    assert_eq!(h.store.contests_for(1).len(), 1);
}
