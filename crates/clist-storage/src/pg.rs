use async_trait::async_trait;
use clist_core::{Contest, ContestField, Extraction, Resource};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::store::{
    ContestStore, ContestUpsert, ContestWrite, PruneQuery, StoreError, WriteAction, WriteOutcome,
};

const CONTEST_COLUMNS: &str = "id, resource_id, key, title, url, standings_url, start_time, end_time, \
     duration_in_secs, slug, title_path, info, is_auto_added, auto_updated";

/// Postgres-backed contest store.
#[derive(Debug, Clone)]
pub struct PgContestStore {
    pool: PgPool,
}

impl PgContestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn lock_token(resource_id: i64, key: &str) -> String {
    format!("contest:{resource_id}:{key}")
}

fn classify(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        // unique_violation, check_violation, foreign_key_violation
        if matches!(db.code().as_deref(), Some("23505" | "23514" | "23503")) {
            return StoreError::Integrity(db.message().to_string());
        }
    }
    StoreError::Database(err)
}

fn contest_from_row(row: &PgRow) -> Result<Contest, sqlx::Error> {
    Ok(Contest {
        id: row.try_get("id")?,
        resource_id: row.try_get("resource_id")?,
        key: row.try_get("key")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        standings_url: row.try_get("standings_url")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_in_secs: row.try_get("duration_in_secs")?,
        slug: row.try_get("slug")?,
        title_path: row.try_get("title_path")?,
        info: row.try_get("info")?,
        is_auto_added: row.try_get("is_auto_added")?,
        auto_updated: row.try_get("auto_updated")?,
    })
}

fn resource_from_row(row: &PgRow) -> Result<Resource, StoreError> {
    let id: i64 = row.try_get("id")?;
    let module: Option<String> = row.try_get("module")?;
    let regex: Option<String> = row.try_get("regex")?;
    let extraction = match (module, regex) {
        (Some(path), None) => Extraction::Module(path),
        (None, Some(pattern)) => Extraction::Regex(pattern),
        _ => {
            return Err(StoreError::Decode(format!(
                "resource {id} must set exactly one of module/regex"
            )))
        }
    };
    Ok(Resource {
        id,
        host: row.try_get("host")?,
        url: row.try_get("url")?,
        parse_url: row.try_get("parse_url")?,
        api_url: row.try_get("api_url")?,
        extraction,
        timezone: row.try_get("timezone")?,
        enabled: row.try_get("enabled")?,
        auto_remove_started: row.try_get("auto_remove_started")?,
        info: row.try_get("info")?,
    })
}

/// Lock the row at `(resource_id, key)` without waiting. `Ok(false)` means it exists but is held elsewhere.
async fn lock_row(
    tx: &mut Transaction<'_, Postgres>,
    resource_id: i64,
    key: &str,
) -> Result<RowLock, StoreError> {
    let locked: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM contests WHERE resource_id = $1 AND key = $2 FOR UPDATE SKIP LOCKED",
    )
    .bind(resource_id)
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;
    if locked.is_some() {
        return Ok(RowLock::Held);
    }
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM contests WHERE resource_id = $1 AND key = $2)",
    )
    .bind(resource_id)
    .bind(key)
    .fetch_one(&mut **tx)
    .await?;
    Ok(if exists { RowLock::Busy } else { RowLock::Absent })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowLock {
    Held,
    Absent,
    Busy,
}

fn upsert_assignments(upsert: &ContestUpsert) -> String {
    let started = "contests.start_time <= $12";
    let mut sets = Vec::new();
    for field in ContestField::ALL {
        if !upsert.updates(field) {
            continue;
        }
        let column = field.column();
        let assignment = match field {
            ContestField::Info => "info = contests.info || EXCLUDED.info".to_string(),
            f if f.is_time() && upsert.ignore_times_after_start => format!(
                "{column} = CASE WHEN {started} THEN contests.{column} ELSE EXCLUDED.{column} END"
            ),
            _ => format!("{column} = EXCLUDED.{column}"),
        };
        sets.push(assignment);
    }
    sets.push("is_auto_added = TRUE".to_string());
    sets.push("auto_updated = EXCLUDED.auto_updated".to_string());
    sets.join(", ")
}

impl PgContestStore {
    async fn apply_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        write: &ContestWrite,
    ) -> Result<WriteOutcome, StoreError> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(lock_token(write.resource_id, &write.key))
            .fetch_one(&mut **tx)
            .await?;
        if !acquired {
            return Ok(WriteOutcome::Locked);
        }
        let current = lock_row(tx, write.resource_id, &write.key).await?;
        if current == RowLock::Busy {
            return Ok(WriteOutcome::Locked);
        }

        if let Some(delete_key) = write.delete_key.as_deref().filter(|k| *k != write.key) {
            if write.suppress_deletes {
                debug!(delete_key, "debug run: keeping row at delete_key");
            } else {
                sqlx::query("DELETE FROM contests WHERE resource_id = $1 AND key = $2")
                    .bind(write.resource_id)
                    .bind(delete_key)
                    .execute(&mut **tx)
                    .await?;
            }
        }

        let mut renamed = false;
        if let Some(old_key) = write.old_key.as_deref().filter(|k| *k != write.key) {
            match lock_row(tx, write.resource_id, old_key).await? {
                RowLock::Busy => return Ok(WriteOutcome::Locked),
                RowLock::Absent => {}
                RowLock::Held if current == RowLock::Absent => {
                    let result = sqlx::query(
                        "UPDATE contests SET key = $3 WHERE resource_id = $1 AND key = $2",
                    )
                    .bind(write.resource_id)
                    .bind(old_key)
                    .bind(&write.key)
                    .execute(&mut **tx)
                    .await?;
                    renamed = result.rows_affected() > 0;
                }
                RowLock::Held if !write.suppress_deletes => {
                    sqlx::query("DELETE FROM contests WHERE resource_id = $1 AND key = $2")
                        .bind(write.resource_id)
                        .bind(old_key)
                        .execute(&mut **tx)
                        .await?;
                }
                RowLock::Held => debug!(old_key, "debug run: keeping row at old_key"),
            }
        }

        let upsert = match &write.action {
            WriteAction::Delete => {
                let result = sqlx::query("DELETE FROM contests WHERE resource_id = $1 AND key = $2")
                    .bind(write.resource_id)
                    .bind(&write.key)
                    .execute(&mut **tx)
                    .await?;
                return Ok(WriteOutcome::Deleted {
                    existed: result.rows_affected() > 0,
                });
            }
            WriteAction::Upsert(upsert) => upsert,
        };

        let sql = format!(
            "INSERT INTO contests (resource_id, key, title, url, standings_url, start_time, end_time, \
             duration_in_secs, slug, title_path, info, is_auto_added, auto_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, TRUE, $12) \
             ON CONFLICT (resource_id, key) DO UPDATE SET {} \
             RETURNING (xmax = 0) AS inserted",
            upsert_assignments(upsert)
        );
        let inserted: bool = sqlx::query_scalar(&sql)
            .bind(write.resource_id)
            .bind(&write.key)
            .bind(&upsert.title)
            .bind(&upsert.url)
            .bind(&upsert.standings_url)
            .bind(upsert.start_time)
            .bind(upsert.end_time)
            .bind(upsert.duration_in_secs)
            .bind(&upsert.slug)
            .bind(&upsert.title_path)
            .bind(JsonValue::Object(upsert.info.clone()))
            .bind(write.now)
            .fetch_one(&mut **tx)
            .await?;

        Ok(if inserted {
            WriteOutcome::Inserted { renamed }
        } else {
            WriteOutcome::Updated { renamed }
        })
    }
}

#[async_trait]
impl ContestStore for PgContestStore {
    async fn load_resources(&self) -> Result<Vec<Resource>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, host, url, parse_url, api_url, module, regex, timezone,
                   enabled, auto_remove_started, info
              FROM resources
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(resource_from_row).collect()
    }

    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let (module, regex) = match &resource.extraction {
            Extraction::Module(path) => (Some(path.as_str()), None),
            Extraction::Regex(pattern) => (None, Some(pattern.as_str())),
        };
        sqlx::query(
            r#"
            INSERT INTO resources (id, host, url, parse_url, api_url, module, regex, timezone,
                                   enabled, auto_remove_started, info)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
               SET host = EXCLUDED.host,
                   url = EXCLUDED.url,
                   parse_url = EXCLUDED.parse_url,
                   api_url = EXCLUDED.api_url,
                   module = EXCLUDED.module,
                   regex = EXCLUDED.regex,
                   timezone = EXCLUDED.timezone,
                   enabled = EXCLUDED.enabled,
                   auto_remove_started = EXCLUDED.auto_remove_started,
                   info = EXCLUDED.info
            "#,
        )
        .bind(resource.id)
        .bind(&resource.host)
        .bind(&resource.url)
        .bind(&resource.parse_url)
        .bind(&resource.api_url)
        .bind(module)
        .bind(regex)
        .bind(&resource.timezone)
        .bind(resource.enabled)
        .bind(resource.auto_remove_started)
        .bind(&resource.info)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn find_contest(&self, resource_id: i64, key: &str) -> Result<Option<Contest>, StoreError> {
        let sql = format!("SELECT {CONTEST_COLUMNS} FROM contests WHERE resource_id = $1 AND key = $2");
        let row = sqlx::query(&sql)
            .bind(resource_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(contest_from_row).transpose()?)
    }

    async fn apply(&self, write: &ContestWrite) -> Result<WriteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        match Self::apply_in_tx(&mut tx, write).await {
            Ok(WriteOutcome::Locked) => {
                tx.rollback().await?;
                Ok(WriteOutcome::Locked)
            }
            Ok(outcome) => {
                tx.commit().await.map_err(classify)?;
                Ok(outcome)
            }
            Err(StoreError::Database(err)) => {
                let _ = tx.rollback().await;
                Err(classify(err))
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    async fn prune_candidates(&self, query: &PruneQuery) -> Result<Vec<Contest>, StoreError> {
        let sql = format!(
            r#"
            SELECT {CONTEST_COLUMNS}
              FROM contests
             WHERE resource_id = $1
               AND is_auto_added
               AND auto_updated < $2
               AND (CASE WHEN $3 THEN end_time > $4 ELSE start_time > $4 END)
               AND NOT (key = ANY($5))
             ORDER BY start_time, id
            "#
        );
        let skip_keys: Vec<String> = query.skip_keys.iter().cloned().collect();
        let rows = sqlx::query(&sql)
            .bind(query.resource_id)
            .bind(query.updated_before)
            .bind(query.auto_remove_started)
            .bind(query.now)
            .bind(skip_keys)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(contest_from_row).collect::<Result<_, _>>()?)
    }

    async fn delete_contests(&self, query: &PruneQuery, ids: &[i64]) -> Result<Vec<Contest>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        // Rows refreshed or held by another run since selection are left alone.
        let sql = format!(
            r#"
            DELETE FROM contests
             WHERE id IN (
                SELECT id
                  FROM contests
                 WHERE id = ANY($1)
                   AND resource_id = $2
                   AND is_auto_added
                   AND auto_updated < $3
                   AND (CASE WHEN $4 THEN end_time > $5 ELSE start_time > $5 END)
                   AND NOT (key = ANY($6))
                   FOR UPDATE SKIP LOCKED
             )
            RETURNING {CONTEST_COLUMNS}
            "#
        );
        let skip_keys: Vec<String> = query.skip_keys.iter().cloned().collect();
        let rows = sqlx::query(&sql)
            .bind(ids)
            .bind(query.resource_id)
            .bind(query.updated_before)
            .bind(query.auto_remove_started)
            .bind(query.now)
            .bind(skip_keys)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(rows.iter().map(contest_from_row).collect::<Result<_, _>>()?)
    }
}
