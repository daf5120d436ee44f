use chrono::{DateTime, Duration, Utc};
use clist_core::{NormalizedContest, SkipReason};
use clist_storage::{ContestUpsert, ContestWrite, WriteAction};
use regex::Regex;

/// Contests ending later than this are treated as garbage dates.
pub const FUTURE_LIMIT_DAYS: i64 = 365;
/// Contests that ended longer ago than this are not touched.
pub const STALE_AFTER_DAYS: i64 = 31;

/// Run-wide knobs for turning a normalized contest into a store write.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub now: DateTime<Utc>,
    pub debug: bool,
    pub skip_check_time: bool,
    pub title_filter: Option<Regex>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Write(ContestWrite),
    /// A deletion debug mode only reports.
    DeleteSuppressed { key: String },
    Skip(SkipReason),
}

impl ReconcilePolicy {
    pub fn decide(&self, contest: &NormalizedContest, archive_only: bool) -> Decision {
        if contest.end_time > self.now + Duration::days(FUTURE_LIMIT_DAYS) {
            return Decision::Skip(SkipReason::TooFarInFuture);
        }
        if contest.end_time < contest.start_time {
            return Decision::Skip(SkipReason::EndBeforeStart);
        }

        let check_time = !(self.debug || self.skip_check_time || contest.skip_check_time || archive_only);
        if check_time && contest.end_time < self.now - Duration::days(STALE_AFTER_DAYS) {
            return Decision::Skip(SkipReason::Stale);
        }
        if contest.skip_update_key {
            return Decision::Skip(SkipReason::SkipUpdateKey);
        }
        if let Some(filter) = &self.title_filter {
            if !filter.is_match(&contest.title) {
                return Decision::Skip(SkipReason::TitleFilter);
            }
        }

        let to_delete = contest.delete_after_end && contest.end_time <= self.now;
        if to_delete && self.debug {
            return Decision::DeleteSuppressed {
                key: contest.key.clone(),
            };
        }
        let action = if to_delete {
            WriteAction::Delete
        } else {
            WriteAction::Upsert(ContestUpsert {
                title: contest.title.clone(),
                url: contest.url.clone(),
                standings_url: contest.standings_url.clone(),
                start_time: contest.start_time,
                end_time: contest.end_time,
                duration_in_secs: contest.duration_in_secs(),
                slug: contest.slug.clone(),
                title_path: contest.title_path.clone(),
                info: contest.info.clone(),
                unchanged: contest.unchanged.clone(),
                ignore_times_after_start: contest.ignore_times_after_start,
            })
        };

        Decision::Write(ContestWrite {
            resource_id: contest.resource_id,
            key: contest.key.clone(),
            old_key: contest.old_key.clone(),
            delete_key: contest.delete_key.clone(),
            action,
            now: self.now,
            suppress_deletes: self.debug,
        })
    }
}
